use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::block::BlockInfo;
use crate::Bitfield;
use super::PeerError;

// Guards against allocation bombs from hostile length prefixes.
pub const MAX_FRAME_LEN: usize = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // Advises the peer not to close an otherwise quiet connection.
    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // We want blocks the peer holds.
    Interested,

    // We no longer want anything the peer holds.
    NotInterested,

    // The sender acquired the piece with this index.
    Have { idx: u32 },

    // Packed piece bits, MSB-first, sent once after the handshake.
    Bitfield(Bitfield),

    // Ask for a block: piece index, offset within piece, length.
    Request(BlockInfo),

    // A block of data.
    Piece { idx: u32, begin: u32, data: Vec<u8> },

    // Withdraw an earlier request.
    Cancel(BlockInfo),

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // <len=0000>
            Message::KeepAlive => dst.put_u32(0),

            // <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Piece { idx, begin, data } => {
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(idx);
                dst.put_u32(begin);
                dst.extend_from_slice(&data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length yet.
        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src);
        let msg_len = peeker.get_u32() as usize;

        if msg_len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(msg_len));
        }

        if src.remaining() < 4 + msg_len {
            // Haven't received all of the message.
            return Ok(None);
        }
        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let payload_ok = match id {
            0..=3 => msg_len == 1,
            4 => msg_len == 5,
            5 => msg_len >= 1,
            6 | 8 => msg_len == 13,
            7 => msg_len >= 9,
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
        };
        if !payload_ok {
            return Err(PeerError::InvalidPayload { id, len: msg_len });
        }

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have { idx: src.get_u32() },
            5 => {
                let mut bits = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bits);
                Message::Bitfield(Bitfield::from_vec(bits))
            },
            6 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let len = src.get_u32();
                Message::Request(BlockInfo { piece_idx, offset, len })
            },
            7 => {
                let idx = src.get_u32();
                let begin = src.get_u32();
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Piece { idx, begin, data }
            },
            8 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let len = src.get_u32();
                Message::Cancel(BlockInfo { piece_idx, offset, len })
            },
            _ => unreachable!("id validated above"),
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for {}", block),
            Message::Piece { idx, begin, data } => write!(
                f,
                "block data {{ piece: {}, offset: {}, len: {} }}",
                idx,
                begin,
                data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for {}", block),
        }
    }
}

#[cfg(test)]
mod tests {
    use bitvec::prelude::*;
    use super::*;

    #[test]
    fn codec_round_trip_stream() {
        // decode(encode(m)) == m for every kind, and the encoded
        // stream is byte-exact.
        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        // Unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        // Interested
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        // Not interested
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Cancel
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x8, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Piece { idx: 0xb, begin: 0x134000, data: vec![0x1, 0x2, 0x3] },
            Message::Cancel(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
        ];
        let expected_buf = buf.clone();

        for msg in expected.into_iter() {
            MessageCodec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn decode_chunked() {
        let mut buf = BytesMut::new();

        // Half of an interested message.
        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(Message::Interested));

        // Half of a piece message.
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[0x2, 0x3]);
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap(),
            Some(Message::Piece { idx: 0xb, begin: 0x134000, data: vec![0x1, 0x2, 0x3] }),
        );
    }

    #[test]
    fn decode_empty_and_incomplete() {
        let mut src = BytesMut::new();
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), None);

        let mut src = BytesMut::from(&[0u8, 1, 2][..]);
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn decode_invalid_id() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]);
        match MessageCodec.decode(&mut src) {
            Err(PeerError::InvalidMessageId(id)) => assert_eq!(id, 255),
            other => panic!("expected InvalidMessageId, got {:?}", other),
        }
    }

    #[test]
    fn decode_payload_length_mismatch() {
        // A choke with a 2-byte payload is a protocol violation.
        let mut src = BytesMut::from(&[0u8, 0, 0, 2, 0, 0][..]);
        match MessageCodec.decode(&mut src) {
            Err(PeerError::InvalidPayload { id: 0, len: 2 }) => {}
            other => panic!("expected InvalidPayload, got {:?}", other),
        }

        // A have with too short a payload.
        let mut src = BytesMut::from(&[0u8, 0, 0, 2, 4, 0][..]);
        assert!(matches!(
            MessageCodec.decode(&mut src),
            Err(PeerError::InvalidPayload { id: 4, len: 2 }),
        ));
    }

    #[test]
    fn decode_oversize_frame() {
        // Length prefix above the cap fails before any allocation.
        let mut src = BytesMut::from(&[0x7fu8, 0xff, 0xff, 0xff][..]);
        assert!(matches!(
            MessageCodec.decode(&mut src),
            Err(PeerError::FrameTooLarge(_)),
        ));
    }
}
