use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, MutexGuard};
use sha1::{Digest, Sha1};
use crate::block::{Block, BlockInfo};
use crate::range::{Covering, Range};
use crate::store::{PackageFile, StoreError};
use crate::ID;

type Result<T> = std::result::Result<T, StoreError>;

/// One SHA-1-verified unit of the package.
///
/// Coverings and validity live behind a single mutex; reads and writes go
/// through the package's file slice, each file serialized by its own lock.
#[derive(Debug)]
pub struct Piece {

    pub idx: u32,

    // Expected SHA-1 of the piece bytes.
    pub hash: ID,

    // Absolute offset of the piece within the package byte stream.
    pub offset: u64,

    pub len: u32,

    // Indices of the package files this piece overlaps.
    pub file_range: std::ops::Range<usize>,

    state: Mutex<PieceState>,

}

#[derive(Debug)]
struct PieceState {

    // Bytes actually on disk.
    have: Covering,

    // Bytes some peer has been asked for; superset of have.
    claimed: Covering,

    // None until computed, then the cached SHA-1 verdict.
    valid: Option<bool>,

}

impl Piece {

    pub fn new(idx: u32, hash: ID, offset: u64, len: u32, file_range: std::ops::Range<usize>) -> Self {
        let domain = Range::new(0, len as u64);
        Self {
            idx,
            hash,
            offset,
            len,
            file_range,
            state: Mutex::new(PieceState {
                have: Covering::new(domain),
                claimed: Covering::new(domain),
                valid: None,
            }),
        }
    }

    fn domain(&self) -> Range {
        Range::new(0, self.len as u64)
    }

    fn state(&self) -> MutexGuard<'_, PieceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_complete(&self) -> bool {
        self.state().have.is_complete()
    }

    /// Started means any byte is on disk or asked for.
    pub fn is_started(&self) -> bool {
        let state = self.state();
        !state.have.is_empty() || !state.claimed.is_empty()
    }

    pub fn have_bytes(&self) -> u64 {
        self.state().have.covered()
    }

    pub fn unclaimed_bytes(&self) -> u64 {
        self.len as u64 - self.state().claimed.covered()
    }

    pub fn cached_valid(&self) -> Option<bool> {
        self.state().valid
    }

    /// Resume path: trust the bytes already present on disk.
    pub(crate) fn assume_complete(&self, valid: Option<bool>) {
        let mut state = self.state();
        let domain = self.domain();
        // Filling the whole domain cannot leave it.
        state.have = state.have.fill(domain).unwrap();
        state.claimed = state.claimed.fill(domain).unwrap();
        state.valid = valid;
    }

    pub fn claim_block(&self, b: &BlockInfo) -> Result<()> {
        let mut state = self.state();
        state.claimed = state.claimed.fill(b.range())?;
        Ok(())
    }

    pub fn unclaim_block(&self, b: &BlockInfo) -> Result<()> {
        let mut state = self.state();
        let mut claimed = state.claimed.poke(b.range())?;
        // Claimed stays a superset of have.
        for have in state.have.ranges().to_vec() {
            claimed = claimed.fill(have)?;
        }
        state.claimed = claimed;
        Ok(())
    }

    /// Gaps of the claimed covering, ascending, split at `max_len`.
    pub fn unclaimed_blocks(&self, max_len: u32) -> Vec<BlockInfo> {
        let gaps = self.state().claimed.gaps(self.domain());
        self.split_blocks(gaps, max_len)
    }

    /// Gaps of the have covering, ascending, split at `max_len`.
    pub fn empty_blocks(&self, max_len: u32) -> Vec<BlockInfo> {
        let gaps = self.state().have.gaps(self.domain());
        self.split_blocks(gaps, max_len)
    }

    fn split_blocks(&self, gaps: Vec<Range>, max_len: u32) -> Vec<BlockInfo> {
        let mut out = Vec::new();
        for gap in gaps {
            let mut first = gap.first;
            while first < gap.last {
                let len = (gap.last - first).min(max_len as u64);
                out.push(BlockInfo {
                    piece_idx: self.idx,
                    offset: first as u32,
                    len: len as u32,
                });
                first += len;
            }
        }
        out
    }

    /// Persist a received block and record it in both coverings. Returns
    /// whether the piece is now complete. Any add invalidates the cached
    /// SHA-1 verdict.
    pub fn add_block(&self, block: &Block, files: &[PackageFile]) -> Result<bool> {
        debug_assert!(block.is_complete(), "writing a partial block");
        self.write_span(block.info.offset, &block.data, files)?;

        let mut state = self.state();
        state.have = state.have.fill(block.info.range())?;
        state.claimed = state.claimed.fill(block.info.range())?;
        state.valid = None;
        Ok(state.have.is_complete())
    }

    /// Re-read the piece from disk and compare SHA-1; cached after the
    /// first computation. Precondition: complete.
    pub fn validate(&self, files: &[PackageFile]) -> Result<bool> {
        if let Some(valid) = self.state().valid {
            return Ok(valid);
        }
        debug_assert!(self.is_complete(), "validating an incomplete piece");

        let mut buf = vec![0u8; self.len as usize];
        self.read_span(0, &mut buf, files)?;
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let valid = hasher.finalize().as_slice() == self.hash;

        self.state().valid = Some(valid);
        if !valid {
            tracing::warn!(piece = self.idx, "piece failed hash check");
        }
        Ok(valid)
    }

    /// Empty both coverings. The disk is left as-is; the bytes are simply
    /// no longer counted.
    pub fn discard(&self) {
        let mut state = self.state();
        let domain = self.domain();
        state.have = Covering::new(domain);
        state.claimed = Covering::new(domain);
        state.valid = Some(false);
    }

    /// Read a block back from disk. Precondition: complete.
    pub fn read_block(&self, info: &BlockInfo, files: &[PackageFile]) -> Result<Block> {
        debug_assert!(self.is_complete(), "reading from an incomplete piece");
        let mut buf = vec![0u8; info.len as usize];
        self.read_span(info.offset, &mut buf, files)?;
        Ok(Block::with_data(*info, buf))
    }

    // Walks the overlapping files, copying sub-spans bounded by file
    // boundaries. File order is fixed; each handle is locked for the
    // seek+write pair.
    fn write_span(&self, begin: u32, data: &[u8], files: &[PackageFile]) -> Result<()> {
        let mut abs = self.offset + begin as u64;
        let end = abs + data.len() as u64;
        let mut rest = data;

        for file in &files[self.file_range.clone()] {
            if rest.is_empty() {
                break;
            }
            let file_end = file.offset + file.length;
            if abs >= file_end {
                continue;
            }
            let n = ((file_end - abs).min(rest.len() as u64)) as usize;
            {
                let mut handle = file.lock()?;
                handle.seek(SeekFrom::Start(abs - file.offset))?;
                handle.write_all(&rest[..n])?;
            }
            rest = &rest[n..];
            abs += n as u64;
        }

        if !rest.is_empty() {
            return Err(StoreError::OutOfBounds { piece: self.idx, offset: abs, end });
        }
        Ok(())
    }

    fn read_span(&self, begin: u32, buf: &mut [u8], files: &[PackageFile]) -> Result<()> {
        let mut abs = self.offset + begin as u64;
        let end = abs + buf.len() as u64;
        let mut filled = 0usize;

        for file in &files[self.file_range.clone()] {
            if filled == buf.len() {
                break;
            }
            let file_end = file.offset + file.length;
            if abs >= file_end {
                continue;
            }
            let n = ((file_end - abs).min((buf.len() - filled) as u64)) as usize;
            {
                let mut handle = file.lock()?;
                handle.seek(SeekFrom::Start(abs - file.offset))?;
                handle.read_exact(&mut buf[filled..filled + n])?;
            }
            filled += n;
            abs += n as u64;
        }

        if filled != buf.len() {
            return Err(StoreError::OutOfBounds { piece: self.idx, offset: abs, end });
        }
        Ok(())
    }
}
