use std::sync::Arc;
use crate::store::StoreInfo;

mod disk;
mod file;
mod memory;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("piece {0} is not in storage")]
    MissingPiece(usize),

    #[error("sync error: {0}")]
    SyncError(String),

}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        StorageError::SyncError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

// Where verified pieces of a torrent are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    #[default]
    Disk,
    Memory,
}

// Backend holding verified piece data. Calls block so are made from the blocking pool.
pub trait Storage: Send + Sync + std::fmt::Debug {

    // Writes a whole verified piece.
    fn write_piece(&self, idx: usize, data: &[u8]) -> Result<()>;

    // Reads a whole piece, fails if the data isn't there.
    fn read_piece(&self, idx: usize) -> Result<Vec<u8>>;

    // Whether every file exists with its full length.
    fn files_complete(&self) -> bool;

    // Deletes all data of the torrent.
    fn remove_files(&self) -> Result<()>;

}

pub fn open(kind: StorageKind, info: &StoreInfo) -> Result<Arc<dyn Storage>> {
    Ok(match kind {
        StorageKind::Disk => Arc::new(DiskStorage::new(info)?),
        StorageKind::Memory => Arc::new(MemoryStorage::new(info)),
    })
}
