use std::{collections::HashMap, sync::{Arc, RwLock}};
use crate::store::StoreInfo;
use super::{Result, Storage, StorageError};

// Keeps pieces in memory, nothing touches the disk.
#[derive(Debug)]
pub struct MemoryStorage {

    num_pieces: usize,

    pieces: RwLock<HashMap<usize, Arc<Vec<u8>>>>,

}

impl MemoryStorage {
    pub fn new(info: &StoreInfo) -> Self {
        Self {
            num_pieces: info.num_pieces,
            pieces: RwLock::new(HashMap::new()),
        }
    }
}

impl Storage for MemoryStorage {

    fn write_piece(&self, idx: usize, data: &[u8]) -> Result<()> {
        self.pieces.write()?.insert(idx, Arc::new(data.to_vec()));
        Ok(())
    }

    fn read_piece(&self, idx: usize) -> Result<Vec<u8>> {
        self.pieces
            .read()?
            .get(&idx)
            .map(|p| p.as_ref().clone())
            .ok_or(StorageError::MissingPiece(idx))
    }

    fn files_complete(&self) -> bool {
        self.pieces.read().map(|p| p.len() == self.num_pieces).unwrap_or(false)
    }

    fn remove_files(&self) -> Result<()> {
        self.pieces.write()?.clear();
        Ok(())
    }
}
