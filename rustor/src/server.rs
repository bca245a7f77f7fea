use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::Instrument;
use crate::controller::{ControllerCommand, ControllerHandle, ControllerTx};
use crate::p2p::handshake;
use crate::ID;

// Conventional BitTorrent port range, probed in order.
pub const PORT_RANGE: std::ops::RangeInclusive<u16> = 6881..=6889;

const CLIENT_PREFIX: &[u8; 7] = b"rustor-";
const CLIENT_VERSION: u8 = 0x01;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Seven-byte client tag, one version byte, twelve random bytes.
pub fn generate_peer_id() -> ID {
    let mut id = [0u8; 20];
    id[..7].copy_from_slice(CLIENT_PREFIX);
    id[7] = CLIENT_VERSION;
    rand::thread_rng().fill(&mut id[8..]);
    id
}

/// The runtime value a host process constructs once: it owns the TCP
/// listener, the local peer id, and the info-hash → controller table that
/// incoming handshakes dispatch through. Nothing here is process-global.
pub struct Server {

    listener: TcpListener,

    port: u16,

    peer_id: ID,

    table: Arc<Mutex<HashMap<ID, ControllerTx>>>,

}

impl Server {

    /// Bind the given port, or the first free one in 6881..6889.
    pub async fn bind(port: Option<u16>) -> std::io::Result<Server> {
        let (listener, port) = match port {
            Some(port) => (TcpListener::bind(("0.0.0.0", port)).await?, port),
            None => {
                let mut bound = None;
                for port in PORT_RANGE {
                    match TcpListener::bind(("0.0.0.0", port)).await {
                        Ok(listener) => {
                            bound = Some((listener, port));
                            break;
                        }
                        Err(e) => tracing::debug!(port, "port unavailable: {}", e),
                    }
                }
                bound.ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        "no free port in 6881..6889",
                    )
                })?
            }
        };

        tracing::info!(port, "listening for peers");
        Ok(Server {
            listener,
            port,
            peer_id: generate_peer_id(),
            table: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer_id(&self) -> ID {
        self.peer_id
    }

    /// Make a controller reachable by incoming peers.
    pub fn register(&self, handle: &ControllerHandle) {
        self.register_tx(handle.info_hash, handle.tx());
    }

    pub(crate) fn register_tx(&self, info_hash: ID, tx: ControllerTx) {
        self.lock_table().insert(info_hash, tx);
    }

    pub fn deregister(&self, info_hash: &ID) {
        self.lock_table().remove(info_hash);
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<ID, ControllerTx>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept loop; runs until the server is dropped. Each connection gets
    /// its own handshake task so a slow peer cannot stall accepts.
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => self.spawn_handshake(stream, addr),
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn spawn_handshake(&self, mut stream: TcpStream, addr: SocketAddr) {
        let table = self.table.clone();
        let peer_id = self.peer_id;
        let span = tracing::info_span!("incoming", %addr);

        tokio::spawn(
            async move {
                let known = |hash: &ID| {
                    table
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .contains_key(hash)
                };
                let result = time::timeout(
                    HANDSHAKE_TIMEOUT,
                    handshake::handshake_incoming(&mut stream, peer_id, known),
                )
                .await;

                match result {
                    Ok(Ok(hs)) => {
                        let tx = table
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .get(&hs.info_hash)
                            .cloned();
                        // The controller decides whether there is room.
                        if let Some(tx) = tx {
                            tx.send(ControllerCommand::PeerStream {
                                addr,
                                stream,
                                handshake: hs,
                                inbound: true,
                            })
                            .ok();
                        }
                    }
                    Ok(Err(e)) => tracing::debug!("handshake rejected: {}", e),
                    Err(_) => tracing::debug!("handshake timed out"),
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use super::*;

    #[test]
    fn peer_id_structure() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(&a[..7], b"rustor-");
        assert_eq!(a[7], CLIENT_VERSION);
        // Twelve random bytes make collisions implausible.
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn binds_first_free_conventional_port() {
        let first = Server::bind(None).await.unwrap();
        assert!(PORT_RANGE.contains(&first.port()));
        let second = Server::bind(None).await.unwrap();
        assert!(PORT_RANGE.contains(&second.port()));
        assert_ne!(first.port(), second.port());
    }

    #[tokio::test]
    async fn dispatches_incoming_peers_by_info_hash() {
        let server = Arc::new(Server::bind(None).await.unwrap());
        let port = server.port();
        let server_id = server.peer_id();

        let info_hash = [0x42u8; 20];
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.register_tx(info_hash, tx);

        let accept_server = server.clone();
        tokio::spawn(async move { accept_server.run().await });

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let our_id = generate_peer_id();
        let hs = handshake::handshake_outgoing(&mut stream, info_hash, our_id)
            .await
            .unwrap();
        assert_eq!(hs.info_hash, info_hash);
        assert_eq!(hs.peer_id, server_id);

        match time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ControllerCommand::PeerStream { handshake, inbound, .. })) => {
                assert!(inbound);
                assert_eq!(handshake.info_hash, info_hash);
                assert_eq!(handshake.peer_id, our_id);
            }
            _ => panic!("expected a dispatched peer stream"),
        }
    }

    #[tokio::test]
    async fn rejects_unknown_info_hash() {
        let server = Arc::new(Server::bind(None).await.unwrap());
        let port = server.port();
        let accept_server = server.clone();
        tokio::spawn(async move { accept_server.run().await });

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let result =
            handshake::handshake_outgoing(&mut stream, [0x43u8; 20], generate_peer_id()).await;
        assert!(result.is_err());
    }
}
