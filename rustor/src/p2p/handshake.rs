use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::ID;
use super::{PeerError, Result};

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// <pstrlen><pstr><reserved>: everything before the two identifiers.
const PREFIX_LEN: usize = 1 + 19 + 8;

/// The two identifiers a completed handshake yields.
#[derive(Clone, Copy)]
pub struct Handshake {
    pub info_hash: ID,
    pub peer_id: ID,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

fn prefix() -> [u8; PREFIX_LEN] {
    let mut buf = [0u8; PREFIX_LEN];
    buf[0] = 19;
    buf[1..20].copy_from_slice(&PROTOCOL);
    // Eight reserved bytes stay zero; received ones are ignored.
    buf
}

// Reads and checks the peer's 28-byte prefix, leaving their identifiers
// on the stream.
async fn read_prefix<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    if len[0] != 19 {
        return Err(PeerError::IncorrectProtocol);
    }

    let mut protocol = [0u8; 19];
    stream.read_exact(&mut protocol).await?;
    if protocol != PROTOCOL {
        return Err(PeerError::IncorrectProtocol);
    }

    let mut reserved = [0u8; 8];
    stream.read_exact(&mut reserved).await?;
    Ok(())
}

async fn read_id<S>(stream: &mut S) -> Result<ID>
where
    S: AsyncRead + Unpin,
{
    let mut id = [0u8; 20];
    stream.read_exact(&mut id).await?;
    Ok(id)
}

/// Outgoing handshake: the full 68 bytes go out at once, the reply must
/// carry our info-hash, and a mirror of our own peer id means we dialed
/// ourselves.
pub async fn handshake_outgoing<S>(stream: &mut S, info_hash: ID, peer_id: ID) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = Vec::with_capacity(PREFIX_LEN + 40);
    hello.extend_from_slice(&prefix());
    hello.extend_from_slice(&info_hash);
    hello.extend_from_slice(&peer_id);
    stream.write_all(&hello).await?;

    read_prefix(stream).await?;
    let their_hash = read_id(stream).await?;
    if their_hash != info_hash {
        return Err(PeerError::IncorrectInfoHash);
    }
    let their_id = read_id(stream).await?;
    if their_id == peer_id {
        return Err(PeerError::SelfConnection);
    }

    tracing::trace!(peer = %String::from_utf8_lossy(&their_id), "outgoing handshake complete");
    Ok(Handshake { info_hash, peer_id: their_id })
}

/// Incoming handshake: only the 28-byte prefix goes out before we know
/// which package the peer wants; our identifiers follow once `known`
/// accepts the offered info-hash.
pub async fn handshake_incoming<S, F>(stream: &mut S, peer_id: ID, known: F) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&ID) -> bool,
{
    stream.write_all(&prefix()).await?;

    read_prefix(stream).await?;
    let info_hash = read_id(stream).await?;
    if !known(&info_hash) {
        return Err(PeerError::UnknownInfoHash);
    }

    let mut reply = Vec::with_capacity(40);
    reply.extend_from_slice(&info_hash);
    reply.extend_from_slice(&peer_id);
    stream.write_all(&reply).await?;

    let their_id = read_id(stream).await?;
    if their_id == peer_id {
        return Err(PeerError::SelfConnection);
    }

    tracing::trace!(peer = %String::from_utf8_lossy(&their_id), "incoming handshake complete");
    Ok(Handshake { info_hash, peer_id: their_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_over_duplex() {
        // Both ends agree on the hash and swap ids.
        let (mut a, mut b) = tokio::io::duplex(256);
        let info_hash = [7u8; 20];
        let dialer_id = [1u8; 20];
        let listener_id = [2u8; 20];

        let listener = tokio::spawn(async move {
            handshake_incoming(&mut b, listener_id, |h| *h == info_hash).await
        });
        let dialed = handshake_outgoing(&mut a, info_hash, dialer_id).await.unwrap();
        let listened = listener.await.unwrap().unwrap();

        assert_eq!(dialed.info_hash, info_hash);
        assert_eq!(listened.info_hash, info_hash);
        assert_eq!(dialed.peer_id, listener_id);
        assert_eq!(listened.peer_id, dialer_id);
    }

    #[tokio::test]
    async fn rejects_unknown_hash() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let listener = tokio::spawn(async move {
            handshake_incoming(&mut b, [2u8; 20], |_| false).await
        });
        // Listener drops the stream, so our side errors too.
        let dialed = handshake_outgoing(&mut a, [7u8; 20], [1u8; 20]).await;
        assert!(dialed.is_err());
        assert!(matches!(
            listener.await.unwrap(),
            Err(PeerError::UnknownInfoHash),
        ));
    }

    #[tokio::test]
    async fn rejects_self_connection() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let info_hash = [7u8; 20];
        let same_id = [9u8; 20];

        let listener = tokio::spawn(async move {
            handshake_incoming(&mut b, same_id, |h| *h == info_hash).await
        });
        let dialed = handshake_outgoing(&mut a, info_hash, same_id).await;
        assert!(matches!(dialed, Err(PeerError::SelfConnection)));
        assert!(matches!(
            listener.await.unwrap(),
            Err(PeerError::SelfConnection),
        ));
    }

    #[tokio::test]
    async fn rejects_wrong_protocol() {
        let (mut a, mut b) = tokio::io::duplex(256);
        tokio::spawn(async move {
            a.write_all(&[18u8]).await.ok();
            a.write_all(b"BitTorrent protocol_not").await.ok();
        });
        let result = handshake_incoming(&mut b, [2u8; 20], |_| true).await;
        assert!(matches!(result, Err(PeerError::IncorrectProtocol)));
    }
}
