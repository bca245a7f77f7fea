use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use url::Url;
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be a non-zero multiple of 20")]
    InvalidPiecesLength,

    #[error("`piece length` must be positive")]
    InvalidPieceLength,

    #[error("info must carry exactly one of `length` and `files`")]
    AmbiguousLength,

    #[error("total size {total} exceeds coverage of {num_pieces} pieces of {piece_length}")]
    SizeExceedsPieces { total: u64, num_pieces: u32, piece_length: u32 },

    #[error("file with negative length")]
    FileNegativeSize,

    #[error("file with no path")]
    FileEmptyPath,

    #[error("file path escapes the package root")]
    FileUnsafePath,

    #[error("invalid announce url: {0}")]
    InvalidUrl(String),
}

type Result<T> = std::result::Result<T, MetaInfoError>;

/// One entry of a multi-file info dictionary.
#[derive(Debug, Clone)]
pub struct FileEntry {

    // Path components below the package root.
    pub path: Vec<String>,

    pub length: u64,

}

/// The parsed `info` dictionary.
#[derive(Debug, Clone)]
pub struct Info {

    pub name: String,

    // Concatenation of all 20-byte SHA-1 values, one per piece.
    pub pieces: Vec<u8>,

    pub piece_length: u32,

    // Exactly one of these is set.
    pub length: Option<u64>,

    pub files: Option<Vec<FileEntry>>,

}

/// A parsed and validated `.torrent`.
#[derive(Debug, Clone)]
pub struct MetaInfo {

    pub announce: Url,

    // Tiers of fallback trackers, outermost first.
    pub announce_list: Option<Vec<Vec<Url>>>,

    pub creation_date: Option<i64>,

    pub created_by: Option<String>,

    pub comment: Option<String>,

    pub encoding: Option<String>,

    pub info: Info,

    info_hash: ID,

}

impl MetaInfo {

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo> {
        MetaInfo::from_bytes(&std::fs::read(path)?)
    }

    /// Parse a bencoded metainfo document. Every key is read explicitly,
    /// so failures name the offending key.
    pub fn from_bytes(raw: &[u8]) -> Result<MetaInfo> {

        let root = bencode::decode(raw)?;

        let announce = parse_url(root.require_str("announce")?)?;
        let announce_list = match root.get("announce-list")? {
            Some(tiers) => Some(parse_announce_list(tiers)?),
            None => None,
        };

        let info_value = root.require_dict("info")?;
        let info = parse_info(info_value)?;

        // The swarm identifier: SHA-1 over the bencoded info dict. Unknown
        // keys (`private`, `md5sum`, `sha1`, ...) are retained by the value
        // tree and participate in the hash, but are otherwise ignored.
        let mut hasher = Sha1::new();
        hasher.update(bencode::encode(info_value));
        let info_hash = hasher.finalize().into();

        let metainfo = MetaInfo {
            announce,
            announce_list,
            creation_date: root.get_int("creation date")?,
            created_by: root.get_str("created by")?.map(String::from),
            comment: root.get_str("comment")?.map(String::from),
            encoding: root.get_str("encoding")?.map(String::from),
            info,
            info_hash,
        };

        tracing::debug!(
            name = %metainfo.info.name,
            info_hash = %metainfo.info_hash_hex(),
            pieces = metainfo.num_pieces(),
            "metainfo parsed",
        );
        Ok(metainfo)
    }

    pub fn info_hash(&self) -> ID {
        self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            // Length is validated to be a multiple of 20 on parse.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn num_pieces(&self) -> u32 {
        (self.info.pieces.len() / 20) as u32
    }

    pub fn piece_len(&self) -> u32 {
        self.info.piece_length
    }

    pub fn is_multi_file(&self) -> bool {
        self.info.files.is_some()
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn total_len(&self) -> u64 {
        match &self.info.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.info.length.unwrap_or(0),
        }
    }

    /// The logical byte stream as file entries, single-file included.
    pub fn file_entries(&self) -> Vec<FileEntry> {
        match &self.info.files {
            Some(files) => files.clone(),
            None => vec![FileEntry {
                path: vec![self.info.name.clone()],
                length: self.info.length.unwrap_or(0),
            }],
        }
    }

    /// Tracker tiers with each tier shuffled, per the multitracker
    /// convention. Falls back to a single tier holding `announce`.
    pub fn trackers(&self) -> Vec<Vec<Url>> {
        if let Some(announce_list) = &self.announce_list {
            let mut tiers = Vec::new();
            for tier in announce_list {
                let mut tier = tier.clone();
                tier.shuffle(&mut rand::thread_rng());
                tiers.push(tier);
            }
            tiers
        } else {
            vec![vec![self.announce.clone()]]
        }
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            let date = chrono::NaiveDateTime::from_timestamp_opt(v, 0);
            date.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

fn parse_url(s: &str) -> Result<Url> {
    Url::parse(s).map_err(|_| MetaInfoError::InvalidUrl(s.into()))
}

fn parse_announce_list(tiers: &bencode::Value) -> Result<Vec<Vec<Url>>> {
    let mut out = Vec::new();
    for tier in tiers.as_list()? {
        let mut urls = Vec::new();
        for url in tier.as_list()? {
            let url = std::str::from_utf8(url.as_bytes()?)
                .map_err(|_| MetaInfoError::InvalidUrl("non-utf8".into()))?;
            urls.push(parse_url(url)?);
        }
        out.push(urls);
    }
    Ok(out)
}

fn parse_info(info: &bencode::Value) -> Result<Info> {

    let name = info.require_str("name")?.to_string();

    let pieces = info.require_bytes("pieces")?.to_vec();
    if pieces.is_empty() || pieces.len() % 20 != 0 {
        return Err(MetaInfoError::InvalidPiecesLength);
    }
    let num_pieces = (pieces.len() / 20) as u32;

    let piece_length = info.require_int("piece length")?;
    if piece_length <= 0 || piece_length > u32::MAX as i64 {
        return Err(MetaInfoError::InvalidPieceLength);
    }
    let piece_length = piece_length as u32;

    let length = info.get_int("length")?;
    let files = match info.get("files")? {
        Some(files) => Some(parse_files(files)?),
        None => None,
    };

    // Exactly one of `length` / `files`.
    let total = match (length, &files) {
        (Some(len), None) if len >= 0 => len as u64,
        (Some(_), None) => return Err(MetaInfoError::FileNegativeSize),
        (None, Some(files)) => files.iter().map(|f| f.length).sum(),
        _ => return Err(MetaInfoError::AmbiguousLength),
    };

    // The declared pieces must cover the total size, with the final piece
    // allowed to run short.
    let covered = piece_length as u64 * num_pieces as u64;
    let min_covered = piece_length as u64 * (num_pieces as u64 - 1);
    if total > covered || total <= min_covered {
        return Err(MetaInfoError::SizeExceedsPieces {
            total,
            num_pieces,
            piece_length,
        });
    }

    Ok(Info {
        name,
        pieces,
        piece_length,
        length: length.map(|l| l as u64),
        files,
    })
}

fn parse_files(files: &bencode::Value) -> Result<Vec<FileEntry>> {
    let mut out = Vec::new();
    for file in files.as_list()? {
        let length = file.require_int("length")?;
        if length < 0 {
            return Err(MetaInfoError::FileNegativeSize);
        }

        let mut path = Vec::new();
        for part in file.require_list("path")? {
            let part = std::str::from_utf8(part.as_bytes()?)
                .map_err(|_| MetaInfoError::FileUnsafePath)?;
            if part.is_empty() || part == "." || part == ".." || part.contains('/') {
                return Err(MetaInfoError::FileUnsafePath);
            }
            path.push(part.to_string());
        }
        if path.is_empty() {
            return Err(MetaInfoError::FileEmptyPath);
        }

        out.push(FileEntry { path, length: length as u64 });
    }
    Ok(out)
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use bencode::Value;
    use crate::testutil::{multi_file_torrent, single_file_torrent};
    use super::*;

    #[test]
    fn parse_single_file() {
        let raw = single_file_torrent("file.bin", 48, 16, &[[1; 20], [2; 20], [3; 20]]);
        let mi = MetaInfo::from_bytes(&raw).unwrap();
        assert_eq!(mi.name(), "file.bin");
        assert_eq!(mi.num_pieces(), 3);
        assert_eq!(mi.piece_len(), 16);
        assert_eq!(mi.total_len(), 48);
        assert!(!mi.is_multi_file());
        assert_eq!(mi.piece_hashes(), vec![[1; 20], [2; 20], [3; 20]]);
        assert_eq!(mi.announce.as_str(), "http://tracker.local/announce");
    }

    #[test]
    fn parse_multi_file() {
        let raw = multi_file_torrent(
            "pkg",
            &[(&["a.txt"], 10), (&["sub", "b.txt"], 20)],
            16,
            &[[0; 20], [1; 20]],
        );
        let mi = MetaInfo::from_bytes(&raw).unwrap();
        assert!(mi.is_multi_file());
        assert_eq!(mi.total_len(), 30);
        let entries = mi.file_entries();
        assert_eq!(entries[0].path, vec!["a.txt"]);
        assert_eq!(entries[1].path, vec!["sub", "b.txt"]);
        assert_eq!(entries[1].length, 20);
    }

    #[test]
    fn info_hash_is_stable_across_reparse() {
        let raw = single_file_torrent("x", 16, 16, &[[7; 20]]);
        let a = MetaInfo::from_bytes(&raw).unwrap();
        let b = MetaInfo::from_bytes(&raw).unwrap();
        assert_eq!(a.info_hash(), b.info_hash());
        assert_ne!(a.info_hash(), [0; 20]);
    }

    #[test]
    fn missing_key_is_named() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::from("x"));
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), Value::from("http://t/a"));
        root.insert(b"info".to_vec(), Value::Dict(info));
        let raw = bencode::encode(&Value::Dict(root));

        match MetaInfo::from_bytes(&raw) {
            Err(MetaInfoError::BencodeError(bencode::Error::MissingKey(k))) => {
                assert_eq!(k, "pieces");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn rejects_both_length_and_files() {
        let mut entry = BTreeMap::new();
        entry.insert(b"length".to_vec(), Value::Int(4));
        entry.insert(b"path".to_vec(), Value::List(vec![Value::from("f")]));

        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::from("x"));
        info.insert(b"length".to_vec(), Value::Int(4));
        info.insert(b"files".to_vec(), Value::List(vec![Value::Dict(entry)]));
        info.insert(b"piece length".to_vec(), Value::Int(4));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0; 20]));

        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), Value::from("http://t/a"));
        root.insert(b"info".to_vec(), Value::Dict(info));
        let raw = bencode::encode(&Value::Dict(root));

        assert!(matches!(
            MetaInfo::from_bytes(&raw),
            Err(MetaInfoError::AmbiguousLength),
        ));
    }

    #[test]
    fn rejects_short_piece_coverage() {
        // 3 pieces of 16 can cover at most 48 bytes.
        let raw = single_file_torrent("x", 49, 16, &[[0; 20], [1; 20], [2; 20]]);
        assert!(matches!(
            MetaInfo::from_bytes(&raw),
            Err(MetaInfoError::SizeExceedsPieces { .. }),
        ));
    }

    #[test]
    fn rejects_bad_pieces_string() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::from("x"));
        info.insert(b"length".to_vec(), Value::Int(16));
        info.insert(b"piece length".to_vec(), Value::Int(16));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0; 19]));

        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), Value::from("http://t/a"));
        root.insert(b"info".to_vec(), Value::Dict(info));
        let raw = bencode::encode(&Value::Dict(root));

        assert!(matches!(
            MetaInfo::from_bytes(&raw),
            Err(MetaInfoError::InvalidPiecesLength),
        ));
    }

    #[test]
    fn rejects_path_traversal() {
        let raw = multi_file_torrent("pkg", &[(&[".."], 16)], 16, &[[0; 20]]);
        assert!(matches!(
            MetaInfo::from_bytes(&raw),
            Err(MetaInfoError::FileUnsafePath),
        ));
    }

    #[test]
    fn announce_tiers() {
        let mut root_dict = bencode::decode(&single_file_torrent("x", 16, 16, &[[0; 20]]))
            .unwrap();
        if let Value::Dict(d) = &mut root_dict {
            d.insert(
                b"announce-list".to_vec(),
                Value::List(vec![
                    Value::List(vec![Value::from("http://a/1"), Value::from("http://a/2")]),
                    Value::List(vec![Value::from("http://b/1")]),
                ]),
            );
        }
        let mi = MetaInfo::from_bytes(&bencode::encode(&root_dict)).unwrap();
        let tiers = mi.trackers();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0].len(), 2);
        assert_eq!(tiers[1][0].as_str(), "http://b/1");
    }
}
