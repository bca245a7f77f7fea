//! Fixtures shared by the unit tests: synthetic torrents built through the
//! bencode encoder, and SHA-1 helpers.

use std::collections::BTreeMap;
use bencode::Value;
use sha1::{Digest, Sha1};
use crate::ID;

pub(crate) fn sha1(data: &[u8]) -> ID {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-1 per piece of a byte stream.
pub(crate) fn piece_hashes(data: &[u8], piece_length: u32) -> Vec<ID> {
    data.chunks(piece_length as usize).map(sha1).collect()
}

pub(crate) fn single_file_torrent(
    name: &str,
    length: u64,
    piece_length: u32,
    hashes: &[ID],
) -> Vec<u8> {
    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Value::from(name));
    info.insert(b"length".to_vec(), Value::Int(length as i64));
    info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
    info.insert(b"pieces".to_vec(), Value::Bytes(hashes.concat()));

    let mut root = BTreeMap::new();
    root.insert(b"announce".to_vec(), Value::from("http://tracker.local/announce"));
    root.insert(b"info".to_vec(), Value::Dict(info));
    bencode::encode(&Value::Dict(root))
}

#[test]
fn sha1_known_vector() {
    use hex_literal::hex;
    assert_eq!(sha1(b"abc"), hex!("a9993e364706816aba3e25717850c26c9cd0d89d"));
    assert_eq!(sha1(b""), hex!("da39a3ee5e6b4b0d3255bfef95601890afd80709"));
}

pub(crate) fn multi_file_torrent(
    name: &str,
    files: &[(&[&str], u64)],
    piece_length: u32,
    hashes: &[ID],
) -> Vec<u8> {
    let mut file_list = Vec::new();
    for (path, length) in files {
        let mut entry = BTreeMap::new();
        entry.insert(b"length".to_vec(), Value::Int(*length as i64));
        entry.insert(
            b"path".to_vec(),
            Value::List(path.iter().map(|p| Value::from(*p)).collect()),
        );
        file_list.push(Value::Dict(entry));
    }

    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Value::from(name));
    info.insert(b"files".to_vec(), Value::List(file_list));
    info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
    info.insert(b"pieces".to_vec(), Value::Bytes(hashes.concat()));

    let mut root = BTreeMap::new();
    root.insert(b"announce".to_vec(), Value::from("http://tracker.local/announce"));
    root.insert(b"info".to_vec(), Value::Dict(info));
    bencode::encode(&Value::Dict(root))
}
