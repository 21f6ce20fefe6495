use std::{
    collections::HashMap,
    num::NonZeroUsize,
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};
use sha1::{Digest, Sha1};
use tokio::sync::watch;
use crate::{
    block::{num_blocks, BlockData, BlockInfo},
    fs::{Storage, StorageError},
    store::StoreInfo,
    Bitfield, ID, BLOCK_SIZE,
};
use super::{PieceState, Priorities, Priority, StreamWindow};

// Pieces kept in memory for reads, both for uploads and streams.
const READ_CACHE_PIECES: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid block {0:?}")]
    InvalidBlock(BlockInfo),

    #[error("bytes {0:?} are out of range")]
    OutOfRange(Range<u64>),

    #[error("piece {0} is not verified")]
    NotVerified(usize),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

}

pub type Result<T> = std::result::Result<T, StoreError>;

// Result of a piece whose last block was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    Verified(usize),
    Failed(usize),
}

// Blocks of a piece collected until the piece is complete.
#[derive(Debug)]
struct PendingPiece {
    data: Vec<u8>,
    received: Vec<bool>,
    num_received: usize,
}

impl PendingPiece {
    fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
            received: vec![false; num_blocks(len)],
            num_received: 0,
        }
    }

    fn add_block(&mut self, block: &BlockData) {
        let idx = block.offset / BLOCK_SIZE;
        if self.received[idx] {
            tracing::trace!("duplicate block at offset {} in piece {}", block.offset, block.piece_idx);
            return;
        }
        self.data[block.offset..block.offset + block.data.len()].copy_from_slice(&block.data);
        self.received[idx] = true;
        self.num_received += 1;
    }

    fn is_complete(&self) -> bool {
        self.num_received == self.received.len()
    }
}

// Tracks which pieces of a torrent are verified and holds their priorities.
// Shared by the torrent, its peers and its streams.
#[derive(Debug)]
pub struct PieceStore {

    info: StoreInfo,

    piece_hashes: Vec<ID>,

    storage: Arc<dyn Storage>,

    // Read without locking by streams and peers.
    verified: Vec<AtomicBool>,

    num_verified: AtomicUsize,

    states: Mutex<Vec<PieceState>>,

    write_buf: Mutex<HashMap<usize, PendingPiece>>,

    priorities: RwLock<Priorities>,

    read_cache: Mutex<lru::LruCache<usize, Arc<Vec<u8>>>>,

    // Bumped on every verified piece to wake waiting readers.
    verified_tx: watch::Sender<u64>,

}

impl PieceStore {

    pub fn new(info: StoreInfo, piece_hashes: Vec<ID>, storage: Arc<dyn Storage>, keep_behind: bool) -> Self {
        let num_pieces = info.num_pieces;
        let (verified_tx, _) = watch::channel(0);
        Self {
            piece_hashes,
            storage,
            verified: (0..num_pieces).map(|_| AtomicBool::new(false)).collect(),
            num_verified: AtomicUsize::new(0),
            states: Mutex::new(vec![PieceState::Missing; num_pieces]),
            write_buf: Mutex::new(HashMap::new()),
            priorities: RwLock::new(Priorities::new(num_pieces, keep_behind)),
            read_cache: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(READ_CACHE_PIECES).unwrap_or(NonZeroUsize::MIN),
            )),
            verified_tx,
            info,
        }
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    pub fn num_pieces(&self) -> usize {
        self.info.num_pieces
    }

    // Adds a received block, once a piece is complete it is hashed and written out.
    // Blocks for pieces already downloaded or verified are ignored.
    pub async fn write_block(self: &Arc<Self>, block: BlockData) -> Result<Option<PieceOutcome>> {
        let info = block.info();
        let idx = block.piece_idx;
        if idx >= self.num_pieces()
            || block.offset % BLOCK_SIZE != 0
            || !info.fits_in(self.info.piece_length(idx))
        {
            return Err(StoreError::InvalidBlock(info));
        }

        let piece = {
            let mut states = self.states();
            if matches!(states[idx], PieceState::Downloaded | PieceState::Verified) {
                return Ok(None);
            }
            let mut write_buf = self.write_buf.lock().unwrap_or_else(PoisonError::into_inner);
            let pending = write_buf
                .entry(idx)
                .or_insert_with(|| PendingPiece::new(self.info.piece_length(idx)));
            pending.add_block(&block);
            if !pending.is_complete() {
                return Ok(None);
            }
            states[idx] = PieceState::Downloaded;
            write_buf.remove(&idx)
        };
        let Some(piece) = piece else { return Ok(None) };

        tracing::trace!("all blocks received for piece {}", idx);
        let hash = self.piece_hashes[idx];
        let storage = Arc::clone(&self.storage);
        let data = Arc::new(piece.data);
        let write_data = Arc::clone(&data);
        let result = tokio::task::spawn_blocking(move || {
            if Sha1::digest(write_data.as_slice()).as_slice() != hash {
                return Ok(false);
            }
            storage.write_piece(idx, &write_data).map(|_| true)
        }).await;

        match result {
            Ok(Ok(true)) => {
                self.read_cache().put(idx, data);
                if self.mark_verified(idx) {
                    Ok(Some(PieceOutcome::Verified(idx)))
                } else {
                    Ok(None)
                }
            }
            Ok(Ok(false)) => {
                tracing::warn!("piece {} failed hash verification", idx);
                self.states()[idx] = PieceState::Missing;
                Ok(Some(PieceOutcome::Failed(idx)))
            }
            Ok(Err(e)) => {
                self.states()[idx] = PieceState::Missing;
                Err(e.into())
            }
            Err(e) => {
                self.states()[idx] = PieceState::Missing;
                Err(e.into())
            }
        }
    }

    // Returns true only for the call that actually marked the piece.
    fn mark_verified(&self, idx: usize) -> bool {
        self.states()[idx] = PieceState::Verified;
        if self.verified[idx].swap(true, Ordering::AcqRel) {
            return false;
        }
        self.num_verified.fetch_add(1, Ordering::AcqRel);
        self.verified_tx.send_modify(|n| *n += 1);
        true
    }

    fn states(&self) -> std::sync::MutexGuard<'_, Vec<PieceState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_cache(&self) -> std::sync::MutexGuard<'_, lru::LruCache<usize, Arc<Vec<u8>>>> {
        self.read_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, idx: usize) -> PieceState {
        self.states().get(idx).copied().unwrap_or_default()
    }

    // Marks a missing piece as requested from a peer.
    pub fn set_requested(&self, idx: usize) {
        if let Some(state) = self.states().get_mut(idx) {
            if *state == PieceState::Missing {
                *state = PieceState::Requested;
            }
        }
    }

    pub fn has_piece(&self, idx: usize) -> bool {
        self.verified.get(idx).map_or(false, |v| v.load(Ordering::Acquire))
    }

    // Whether the piece containing the byte at offset is verified.
    pub fn has_bytes(&self, offset: u64) -> bool {
        self.info.piece_at(offset).map_or(false, |idx| self.has_piece(idx))
    }

    pub fn has_range(&self, range: Range<u64>) -> bool {
        self.info.pieces_in(range).all(|idx| self.has_piece(idx))
    }

    pub fn num_verified(&self) -> usize {
        self.num_verified.load(Ordering::Acquire)
    }

    pub fn verified_bitfield(&self) -> Bitfield {
        self.verified.iter().map(|v| v.load(Ordering::Acquire)).collect()
    }

    // Receiver whose value changes every time a piece is verified.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.verified_tx.subscribe()
    }

    // Reads bytes of the torrent, every piece in the range must be verified.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let range = offset..offset + len as u64;
        if range.end > self.info.total_len {
            return Err(StoreError::OutOfRange(range));
        }
        let mut buf = Vec::with_capacity(len);
        for idx in self.info.pieces_in(range.clone()) {
            let piece = self.read_piece(idx).await?;
            let piece_range = self.info.piece_range(idx);
            let start = range.start.max(piece_range.start) - piece_range.start;
            let end = range.end.min(piece_range.end) - piece_range.start;
            buf.extend_from_slice(&piece[start as usize..end as usize]);
        }
        Ok(buf)
    }

    // Reads a block requested by a peer.
    pub async fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>> {
        if block.piece_idx >= self.num_pieces() || !block.fits_in(self.info.piece_length(block.piece_idx)) {
            return Err(StoreError::InvalidBlock(block));
        }
        let piece = self.read_piece(block.piece_idx).await?;
        Ok(piece[block.offset..block.offset + block.len].to_vec())
    }

    async fn read_piece(&self, idx: usize) -> Result<Arc<Vec<u8>>> {
        if !self.has_piece(idx) {
            return Err(StoreError::NotVerified(idx));
        }
        if let Some(piece) = self.read_cache().get(&idx) {
            tracing::trace!("cache hit for piece {}", idx);
            return Ok(Arc::clone(piece));
        }
        let storage = Arc::clone(&self.storage);
        let piece = Arc::new(tokio::task::spawn_blocking(move || storage.read_piece(idx)).await??);
        self.read_cache().put(idx, Arc::clone(&piece));
        Ok(piece)
    }

    // Finds pieces already in storage. Pieces set in trusted are taken as
    // verified when all files are complete, everything else is hashed.
    pub async fn check_files(&self, trusted: Option<Bitfield>) -> Result<usize> {
        let storage = Arc::clone(&self.storage);
        let hashes = self.piece_hashes.clone();
        let found = tokio::task::spawn_blocking(move || {
            let trust = storage.files_complete();
            hashes
                .iter()
                .enumerate()
                .filter(|(idx, hash)| {
                    if trust && trusted.as_ref().map_or(false, |t| t.get(*idx).map_or(false, |b| *b)) {
                        return true;
                    }
                    match storage.read_piece(*idx) {
                        Ok(data) => Sha1::digest(&data).as_slice() == hash.as_slice(),
                        Err(_) => false,
                    }
                })
                .map(|(idx, _)| idx)
                .collect::<Vec<_>>()
        }).await?;

        for idx in found.iter() {
            self.mark_verified(*idx);
        }
        tracing::info!("found {} of {} pieces in storage", found.len(), self.num_pieces());
        Ok(found.len())
    }

    pub async fn remove_files(&self) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        self.read_cache().clear();
        tokio::task::spawn_blocking(move || storage.remove_files()).await??;
        Ok(())
    }

    fn priorities(&self) -> std::sync::RwLockReadGuard<'_, Priorities> {
        self.priorities.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn priorities_mut(&self) -> std::sync::RwLockWriteGuard<'_, Priorities> {
        self.priorities.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn priority(&self, idx: usize) -> Priority {
        self.priorities().get(idx)
    }

    // Runs f with the current effective priorities.
    pub fn with_priorities<R>(&self, f: impl FnOnce(&[Priority]) -> R) -> R {
        f(self.priorities().as_slice())
    }

    pub fn set_priority(&self, range: Range<usize>, priority: Priority) -> bool {
        self.priorities_mut().set_base(range, priority)
    }

    pub fn set_stream_window(&self, stream: u64, window: StreamWindow) -> bool {
        self.priorities_mut().set_window(stream, window)
    }

    pub fn stream_window(&self, stream: u64) -> Option<StreamWindow> {
        self.priorities().window(stream).cloned()
    }

    pub fn clear_stream(&self, stream: u64) -> bool {
        self.priorities_mut().clear_window(stream)
    }

    pub fn has_streams(&self) -> bool {
        self.priorities().has_streams()
    }

    pub fn is_wanted(&self, idx: usize) -> bool {
        self.priority(idx) > Priority::None
    }

    // Total length of pieces with a priority above none.
    pub fn wanted_bytes(&self) -> u64 {
        self.with_priorities(|p| {
            p.iter()
                .enumerate()
                .filter(|(_, p)| **p > Priority::None)
                .map(|(idx, _)| self.info.piece_length(idx) as u64)
                .sum()
        })
    }

    pub fn downloaded_wanted_bytes(&self) -> u64 {
        self.with_priorities(|p| {
            p.iter()
                .enumerate()
                .filter(|(idx, p)| **p > Priority::None && self.has_piece(*idx))
                .map(|(idx, _)| self.info.piece_length(idx) as u64)
                .sum()
        })
    }

    // Number of wanted pieces that aren't verified yet.
    pub fn wanted_remaining(&self) -> usize {
        self.with_priorities(|p| {
            p.iter()
                .enumerate()
                .filter(|(idx, p)| **p > Priority::None && !self.has_piece(*idx))
                .count()
        })
    }

    pub fn num_wanted(&self) -> usize {
        self.with_priorities(|p| p.iter().filter(|p| **p > Priority::None).count())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use crate::{
        block::block_len,
        fs::MemoryStorage,
        metainfo::{test_data, test_metainfo_multi},
    };
    use super::*;

    fn store(lens: &[usize], piece_len: usize) -> (Arc<PieceStore>, Vec<u8>) {
        let metainfo = test_metainfo_multi(lens, piece_len);
        let info = StoreInfo::new(&metainfo, PathBuf::new());
        let storage = Arc::new(MemoryStorage::new(&info));
        let data = lens.iter().enumerate().flat_map(|(i, l)| test_data(*l, i as u8)).collect();
        (Arc::new(PieceStore::new(info, metainfo.piece_hashes(), storage, false)), data)
    }

    fn blocks(store: &PieceStore, data: &[u8], idx: usize) -> Vec<BlockData> {
        let range = store.info().piece_range(idx);
        let piece = &data[range.start as usize..range.end as usize];
        (0..num_blocks(piece.len()))
            .map(|b| BlockData {
                piece_idx: idx,
                offset: b * BLOCK_SIZE,
                data: piece[b * BLOCK_SIZE..b * BLOCK_SIZE + block_len(piece.len(), b)].to_vec(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_write_and_verify_piece() {
        let (store, data) = store(&[100_000], 32_768);
        let mut rx = store.subscribe();
        let blocks = blocks(&store, &data, 1);

        assert_eq!(store.write_block(blocks[0].clone()).await.unwrap(), None);
        assert!(!store.has_piece(1));
        assert_eq!(store.write_block(blocks[1].clone()).await.unwrap(), Some(PieceOutcome::Verified(1)));
        assert!(store.has_piece(1));
        assert!(store.has_bytes(32_768));
        assert!(!store.has_bytes(0));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);

        // Blocks for a verified piece are ignored.
        assert_eq!(store.write_block(blocks[1].clone()).await.unwrap(), None);
        assert_eq!(store.num_verified(), 1);

        let read = store.read(32_768 + 100, 1000).await.unwrap();
        assert_eq!(read, &data[32_868..33_868]);
        assert!(matches!(store.read(0, 10).await, Err(StoreError::NotVerified(0))));
    }

    #[tokio::test]
    async fn test_hash_mismatch_resets_piece() {
        let (store, data) = store(&[40_000], 16_384);
        let mut block = blocks(&store, &data, 0).remove(0);
        block.data[0] ^= 0xff;
        assert_eq!(store.write_block(block).await.unwrap(), Some(PieceOutcome::Failed(0)));
        assert_eq!(store.state(0), PieceState::Missing);
        assert!(!store.has_piece(0));

        // Piece can be downloaded again afterwards.
        let block = blocks(&store, &data, 0).remove(0);
        assert_eq!(store.write_block(block).await.unwrap(), Some(PieceOutcome::Verified(0)));
    }

    #[tokio::test]
    async fn test_invalid_block_rejected() {
        let (store, _) = store(&[40_000], 16_384);
        let block = BlockData { piece_idx: 2, offset: 0, data: vec![0; BLOCK_SIZE] };
        assert!(matches!(store.write_block(block).await, Err(StoreError::InvalidBlock(_))));
        let block = BlockData { piece_idx: 9, offset: 0, data: vec![0; 10] };
        assert!(matches!(store.write_block(block).await, Err(StoreError::InvalidBlock(_))));
    }

    #[tokio::test]
    async fn test_wanted_bytes_follow_priority() {
        let (store, data) = store(&[16_384 * 4], 16_384);
        assert_eq!(store.wanted_bytes(), 16_384 * 4);
        store.set_priority(2..4, Priority::None);
        assert_eq!(store.wanted_bytes(), 16_384 * 2);
        assert_eq!(store.wanted_remaining(), 2);

        for block in blocks(&store, &data, 0) {
            store.write_block(block).await.unwrap();
        }
        assert_eq!(store.downloaded_wanted_bytes(), 16_384);
        assert_eq!(store.wanted_remaining(), 1);
    }

    #[tokio::test]
    async fn test_check_files() {
        let (store, data) = store(&[40_000], 16_384);
        for block in blocks(&store, &data, 2) {
            store.write_block(block).await.unwrap();
        }
        // Same storage seen by a fresh store.
        let fresh = PieceStore::new(store.info().clone(), store.piece_hashes.clone(), Arc::clone(&store.storage), false);
        assert_eq!(fresh.check_files(None).await.unwrap(), 1);
        assert!(fresh.has_piece(2));
        assert!(!fresh.has_piece(0));
    }
}
