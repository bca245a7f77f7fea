use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use crate::block::{Block, BlockInfo};
use crate::metainfo::MetaInfo;
use crate::piece::Piece;
use crate::Bitfield;

type Result<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Covering(#[from] crate::range::CoveringError),

    #[error("sync error: {0}")]
    SyncError(String),

    #[error("no piece with index {0}")]
    BadPieceIndex(u32),

    #[error("piece {piece} span {offset}..{end} exceeds its files")]
    OutOfBounds { piece: u32, offset: u64, end: u64 },

    #[error("package is read-only")]
    ReadOnly,
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        StoreError::SyncError(e.to_string())
    }
}

/// One file backing part of the package byte stream. The handle lock is
/// held across every seek+read / seek+write pair.
#[derive(Debug)]
pub struct PackageFile {

    pub path: PathBuf,

    // Offset of this file within the package byte stream.
    pub offset: u64,

    // Declared length, which the open handle may not have reached yet.
    pub length: u64,

    handle: Mutex<fs::File>,

}

impl PackageFile {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, fs::File>> {
        Ok(self.handle.lock()?)
    }
}

/// A package: the disk-backed, partially-filled byte stream a metainfo
/// describes, owning all pieces and file handles.
#[derive(Debug)]
pub struct Package {

    pieces: Vec<Piece>,

    files: Vec<PackageFile>,

    piece_len: u32,

    total_len: u64,

    read_only: AtomicBool,

}

impl Package {

    /// Bind a metainfo to a destination: the file itself for single-file
    /// packages, the parent directory for multi-file ones (the root
    /// directory named by the metainfo is created on demand). Files that
    /// already exist with their declared length are assumed complete, and
    /// with `assume_valid` also assumed to hash correctly; otherwise they
    /// are re-hashed and discarded on mismatch.
    pub fn bind(metainfo: &MetaInfo, dest: &Path, assume_valid: bool) -> Result<Package> {

        let root = if metainfo.is_multi_file() {
            dest.join(metainfo.name())
        } else {
            dest.to_path_buf()
        };

        let mut files = Vec::new();
        let mut present = Vec::new();
        let mut offset = 0u64;
        for entry in metainfo.file_entries() {
            let path = if metainfo.is_multi_file() {
                let mut p = root.clone();
                for part in &entry.path {
                    p.push(part);
                }
                p
            } else {
                root.clone()
            };

            if let Some(dir) = path.parent() {
                if !dir.is_dir() {
                    tracing::info!("creating directory {:?}", dir);
                    fs::create_dir_all(dir)?;
                }
            }

            let existed = path.is_file()
                && fs::metadata(&path).map(|m| m.len()).unwrap_or(0) == entry.length;
            let handle = fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;

            present.push(existed);
            files.push(PackageFile {
                path,
                offset,
                length: entry.length,
                handle: Mutex::new(handle),
            });
            offset += entry.length;
        }

        let total_len = metainfo.total_len();
        let piece_len = metainfo.piece_len();
        let hashes = metainfo.piece_hashes();
        let mut pieces = Vec::with_capacity(hashes.len());
        for (idx, hash) in hashes.into_iter().enumerate() {
            let offset = idx as u64 * piece_len as u64;
            let len = (total_len - offset).min(piece_len as u64) as u32;
            let file_range = file_intersections(&files, offset, len);
            pieces.push(Piece::new(idx as u32, hash, offset, len, file_range));
        }

        let package = Package {
            pieces,
            files,
            piece_len,
            total_len,
            read_only: AtomicBool::new(false),
        };

        // Resume: a piece counts as already-downloaded when every file it
        // overlaps was present at its declared length.
        for piece in &package.pieces {
            if !present[piece.file_range.clone()].iter().all(|p| *p) {
                continue;
            }
            if assume_valid {
                piece.assume_complete(Some(true));
            } else {
                piece.assume_complete(None);
                if !piece.validate(&package.files)? {
                    piece.discard();
                }
            }
        }

        let complete = package.num_complete();
        if complete > 0 {
            tracing::info!(
                pieces = package.pieces.len(),
                resumed = complete,
                "package bound with existing data",
            );
        }
        Ok(package)
    }

    pub fn num_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn piece_len(&self) -> u32 {
        self.piece_len
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn piece(&self, idx: u32) -> Result<&Piece> {
        self.pieces
            .get(idx as usize)
            .ok_or(StoreError::BadPieceIndex(idx))
    }

    /// Write a received block through to disk. Returns whether its piece
    /// is now complete (pending validation).
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(StoreError::ReadOnly);
        }
        self.piece(block.info.piece_idx)?.add_block(block, &self.files)
    }

    pub fn read_block(&self, info: &BlockInfo) -> Result<Block> {
        self.piece(info.piece_idx)?.read_block(info, &self.files)
    }

    pub fn validate_piece(&self, idx: u32) -> Result<bool> {
        self.piece(idx)?.validate(&self.files)
    }

    pub fn discard_piece(&self, idx: u32) -> Result<()> {
        self.piece(idx)?.discard();
        Ok(())
    }

    pub fn claim_block(&self, info: &BlockInfo) -> Result<()> {
        self.piece(info.piece_idx)?.claim_block(info)
    }

    pub fn unclaim_block(&self, info: &BlockInfo) -> Result<()> {
        self.piece(info.piece_idx)?.unclaim_block(info)
    }

    /// One bit per piece, MSB-first; exactly ceil(P/8) bytes on the wire.
    pub fn bitfield(&self) -> Bitfield {
        let mut bf = Bitfield::repeat(false, self.pieces.len());
        for (idx, piece) in self.pieces.iter().enumerate() {
            if piece.is_complete() {
                bf.set(idx, true);
            }
        }
        bf
    }

    pub fn num_complete(&self) -> u32 {
        self.pieces.iter().filter(|p| p.is_complete()).count() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.is_complete())
    }

    pub fn bytes_left(&self) -> u64 {
        self.pieces
            .iter()
            .map(|p| p.len as u64 - p.have_bytes())
            .sum()
    }

    /// Once every piece is complete and valid the handles can be swapped
    /// for read-only ones; later writes fail with `ReadOnly`.
    pub fn reopen_read_only(&self) -> Result<()> {
        debug_assert!(self.is_complete());
        for file in &self.files {
            let mut handle = file.lock()?;
            *handle = fs::File::open(&file.path)?;
        }
        self.read_only.store(true, Ordering::Release);
        tracing::info!("package reopened read-only");
        Ok(())
    }
}

// First and last file a span intersects, as an index range.
fn file_intersections(files: &[PackageFile], offset: u64, len: u32) -> std::ops::Range<usize> {
    let end = offset + len as u64;
    let mut first = files.len();
    let mut last = files.len();
    for (idx, file) in files.iter().enumerate() {
        let file_end = file.offset + file.length;
        if first == files.len() && offset < file_end && file.length > 0 {
            first = idx;
        }
        if offset < file_end && file.offset < end {
            last = idx + 1;
        }
    }
    if first == files.len() {
        // Zero-length tail; an empty range keeps IO away from it.
        return 0..0;
    }
    first..last
}
