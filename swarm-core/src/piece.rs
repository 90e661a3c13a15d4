//! Piece manager: fixed-size pieces, per-file possession bitmaps, missing-piece iteration.
//!
//! Bits are `AtomicBool`s so many download tasks and transfer-server tasks can mark and
//! query pieces of the same file concurrently. A bit is set only after the piece bytes are
//! on disk (release), and servers check it before reading (acquire).

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::PieceError;
use crate::ids::FileId;

/// Piece size in bytes for every file. The final piece may be shorter.
pub const PIECE_SIZE: u64 = 512 * 1024; // 512 KiB

/// Largest file whose piece count fits the `u32` piece index.
pub const MAX_FILE_SIZE: u64 = PIECE_SIZE * u32::MAX as u64;

/// Number of pieces for a file of `size` bytes: ceil(size / PIECE_SIZE).
/// Saturates at `u32::MAX` above `MAX_FILE_SIZE`; the tracker refuses such files.
pub fn piece_count(size: u64) -> u32 {
    u32::try_from(size.div_ceil(PIECE_SIZE)).unwrap_or(u32::MAX)
}

/// Byte range of piece `index`: [index * PIECE_SIZE, min(size, (index + 1) * PIECE_SIZE)).
/// `None` if the index is past the last piece.
pub fn piece_range(size: u64, index: u32) -> Option<Range<u64>> {
    if index >= piece_count(size) {
        return None;
    }
    let start = index as u64 * PIECE_SIZE;
    let end = (start + PIECE_SIZE).min(size);
    Some(start..end)
}

/// Snapshot of piece possession, one bool per piece in index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap(Vec<bool>);

impl Bitmap {
    pub fn full(piece_count: u32) -> Self {
        Bitmap(vec![true; piece_count as usize])
    }

    pub fn from_bits(bits: Vec<bool>) -> Self {
        Bitmap(bits)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// False for indices past the end.
    pub fn has(&self, index: u32) -> bool {
        self.0.get(index as usize).copied().unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.0.iter().filter(|b| **b).count()
    }

    /// Vacuously true for a zero-piece file.
    pub fn is_complete(&self) -> bool {
        self.0.iter().all(|b| *b)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }
}

/// One catalog entry.
#[derive(Debug)]
struct LocalFile {
    name: String,
    size: u64,
    bits: Box<[AtomicBool]>,
}

impl LocalFile {
    fn new(name: String, size: u64, complete: bool) -> Self {
        let bits = (0..piece_count(size))
            .map(|_| AtomicBool::new(complete))
            .collect();
        Self { name, size, bits }
    }

    fn piece_count(&self) -> u32 {
        self.bits.len() as u32
    }

    fn has(&self, index: u32) -> bool {
        self.bits
            .get(index as usize)
            .map(|b| b.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn snapshot(&self) -> Bitmap {
        Bitmap(self.bits.iter().map(|b| b.load(Ordering::Acquire)).collect())
    }
}

/// Catalog row for "show downloads".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileStatus {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub held: u32,
    pub piece_count: u32,
}

impl LocalFileStatus {
    pub fn is_complete(&self) -> bool {
        self.held == self.piece_count
    }
}

/// Local piece catalog of one peer.
#[derive(Debug, Default)]
pub struct PieceManager {
    files: RwLock<HashMap<FileId, Arc<LocalFile>>>,
}

impl PieceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to the catalog with every bit set to `complete`. If the file is already
    /// present its bitmap is kept, so restarting a download resumes it; registering it as
    /// complete sets every bit.
    pub fn register(&self, file_id: FileId, name: &str, size: u64, complete: bool) -> Bitmap {
        let mut files = self.files.write();
        let file = files
            .entry(file_id)
            .or_insert_with(|| Arc::new(LocalFile::new(name.to_string(), size, complete)));
        if complete {
            for bit in file.bits.iter() {
                bit.store(true, Ordering::Release);
            }
        }
        file.snapshot()
    }

    fn file(&self, file_id: FileId) -> Result<Arc<LocalFile>, PieceError> {
        self.files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or(PieceError::UnknownFile(file_id))
    }

    pub fn bitmap_for(&self, file_id: FileId) -> Result<Bitmap, PieceError> {
        Ok(self.file(file_id)?.snapshot())
    }

    /// Set the bit for `piece_index`. Returns true if the bit was newly set.
    pub fn mark_received(&self, file_id: FileId, piece_index: u32) -> Result<bool, PieceError> {
        let file = self.file(file_id)?;
        let bit = file
            .bits
            .get(piece_index as usize)
            .ok_or(PieceError::IndexOutOfRange {
                file_id,
                piece_index,
                piece_count: file.piece_count(),
            })?;
        Ok(!bit.swap(true, Ordering::AcqRel))
    }

    pub fn has_piece(&self, file_id: FileId, piece_index: u32) -> Result<bool, PieceError> {
        let file = self.file(file_id)?;
        if piece_index >= file.piece_count() {
            return Err(PieceError::IndexOutOfRange {
                file_id,
                piece_index,
                piece_count: file.piece_count(),
            });
        }
        Ok(file.has(piece_index))
    }

    /// Byte range to serve for a remote request. Files missing from the catalog are reported
    /// as `PieceNotAvailable`, same as a clear bit.
    pub fn piece_to_serve(&self, file_id: FileId, piece_index: u32) -> Result<Range<u64>, PieceError> {
        let not_available = PieceError::PieceNotAvailable {
            file_id,
            piece_index,
        };
        let file = self.file(file_id).map_err(|_| not_available.clone())?;
        let range = piece_range(file.size, piece_index).ok_or(PieceError::IndexOutOfRange {
            file_id,
            piece_index,
            piece_count: file.piece_count(),
        })?;
        if !file.has(piece_index) {
            return Err(not_available);
        }
        Ok(range)
    }

    /// Ascending indices of pieces not yet held. Each call starts a fresh scan.
    pub fn missing_pieces(&self, file_id: FileId) -> Result<MissingPieces, PieceError> {
        Ok(MissingPieces {
            file: self.file(file_id)?,
            next: 0,
        })
    }

    pub fn is_complete(&self, file_id: FileId) -> Result<bool, PieceError> {
        let file = self.file(file_id)?;
        Ok(file.bits.iter().all(|b| b.load(Ordering::Acquire)))
    }

    pub fn catalog(&self) -> Vec<LocalFileStatus> {
        let files = self.files.read();
        let mut out: Vec<LocalFileStatus> = files
            .iter()
            .map(|(id, f)| LocalFileStatus {
                file_id: *id,
                name: f.name.clone(),
                size: f.size,
                held: f.snapshot().count() as u32,
                piece_count: f.piece_count(),
            })
            .collect();
        out.sort_by_key(|s| s.file_id);
        out
    }
}

/// Lazy iterator over missing piece indices. Sees bits set after it was created.
#[derive(Debug)]
pub struct MissingPieces {
    file: Arc<LocalFile>,
    next: u32,
}

impl Iterator for MissingPieces {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while self.next < self.file.piece_count() {
            let i = self.next;
            self.next += 1;
            if !self.file.has(i) {
                return Some(i);
            }
        }
        None
    }
}
