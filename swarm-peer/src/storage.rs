//! On-disk piece storage. Every read and write opens its own handle and seeks to the piece
//! offset, so tasks working on different pieces of one file never wait on each other.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use swarm_core::piece::piece_range;
use swarm_core::FileId;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} has no local storage")]
    UnknownFile(FileId),
    #[error("piece {piece_index} out of range for {file_id}")]
    OutOfRange { file_id: FileId, piece_index: u32 },
    #[error("piece {piece_index} of {file_id}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        file_id: FileId,
        piece_index: u32,
        expected: u64,
        actual: u64,
    },
}

#[derive(Debug, Clone)]
struct StoredFile {
    path: PathBuf,
    size: u64,
}

#[derive(Debug, Default)]
pub struct PieceStore {
    files: RwLock<HashMap<FileId, StoredFile>>,
}

impl PieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an existing complete file.
    pub fn add(&self, file_id: FileId, path: &Path, size: u64) {
        self.files.write().insert(
            file_id,
            StoredFile {
                path: path.to_path_buf(),
                size,
            },
        );
    }

    /// Create (or reopen, keeping contents) the destination of a download and size it.
    pub async fn allocate(&self, file_id: FileId, path: &Path, size: u64) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        file.set_len(size).await?;
        self.add(file_id, path, size);
        Ok(())
    }

    pub fn path(&self, file_id: FileId) -> Option<PathBuf> {
        self.files.read().get(&file_id).map(|f| f.path.clone())
    }

    fn locate(&self, file_id: FileId, piece_index: u32) -> Result<(PathBuf, u64, u64), StorageError> {
        let stored = self
            .files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or(StorageError::UnknownFile(file_id))?;
        let range = piece_range(stored.size, piece_index).ok_or(StorageError::OutOfRange {
            file_id,
            piece_index,
        })?;
        Ok((stored.path, range.start, range.end - range.start))
    }

    /// Exact bytes of one piece; the last piece is shorter when size is not a multiple of the piece size.
    pub async fn read_piece(&self, file_id: FileId, piece_index: u32) -> Result<Vec<u8>, StorageError> {
        let (path, offset, len) = self.locate(file_id, piece_index)?;
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn write_piece(
        &self,
        file_id: FileId,
        piece_index: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let (path, offset, len) = self.locate(file_id, piece_index)?;
        if data.len() as u64 != len {
            return Err(StorageError::LengthMismatch {
                file_id,
                piece_index,
                expected: len,
                actual: data.len() as u64,
            });
        }
        let mut file = OpenOptions::new().write(true).open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }
}
