use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU8, Ordering},
};
use tokio::sync::RwLock;
use crate::{
    block::BlockInfo,
    pieces::{PieceState, PieceStore, Priority},
    Bitfield,
};

mod availability;
mod partial_piece;
mod strategy;

pub use availability::Availability;
pub use strategy::Strategy;
use partial_piece::PartialPiece;

// Decides which blocks each peer requests next.
#[derive(Debug)]
pub struct Picker {

    strategy: AtomicU8,

    pub availability: RwLock<Availability>,

    partial_pieces: RwLock<HashMap<usize, PartialPiece>>,

    // Fraction of wanted pieces left at which duplicate requests are allowed.
    endgame_ratio: f64,

}

impl Picker {

    pub fn new(num_pieces: usize, strategy: Strategy, endgame_ratio: f64) -> Self {
        Self {
            strategy: AtomicU8::new(strategy as u8),
            availability: RwLock::new(Availability::new(num_pieces)),
            partial_pieces: RwLock::new(HashMap::new()),
            endgame_ratio,
        }
    }

    pub fn strategy(&self) -> Strategy {
        Strategy::from(self.strategy.load(Ordering::Acquire))
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        let old = self.strategy.swap(strategy as u8, Ordering::AcqRel);
        if old != strategy as u8 {
            tracing::debug!("piece strategy set to {:?}", strategy);
        }
    }

    // Picks up to target minus current blocks that the peer with bitfield bf has.
    // Partially requested pieces are finished first, then new pieces are started.
    pub async fn pick_blocks(
        &self,
        store: &PieceStore,
        current: &HashSet<BlockInfo>,
        target: usize,
        bf: &Bitfield,
    ) -> Vec<BlockInfo> {

        let mut requests = Vec::new();
        let mut remaining = target.saturating_sub(current.len());
        if remaining == 0 {
            return requests;
        }

        let priorities = store.with_priorities(|p| p.to_vec());
        let wanted = |idx: usize| {
            priorities.get(idx).map_or(false, |p| *p > Priority::None)
                && bf.get(idx).map_or(false, |b| *b)
                && !store.has_piece(idx)
        };

        let mut partial_pieces = self.partial_pieces.write().await;

        let mut partials: Vec<usize> = partial_pieces.keys().copied().filter(|idx| wanted(*idx)).collect();
        Strategy::Sequential.sort(&mut partials, &priorities, &[]);
        for idx in partials.iter() {
            if remaining == 0 {
                return requests;
            }
            if let Some(piece) = partial_pieces.get_mut(idx) {
                remaining -= piece.pick_next_blocks(remaining, &mut requests, current, false);
            }
        }

        let mut candidates: Vec<usize> = (0..priorities.len())
            .filter(|idx| wanted(*idx) && !partial_pieces.contains_key(idx) && store.state(*idx) == PieceState::Missing)
            .collect();
        let availability = self.availability.read().await;
        self.strategy().sort(&mut candidates, &priorities, availability.as_slice());
        drop(availability);

        for idx in candidates {
            if remaining == 0 {
                return requests;
            }
            tracing::trace!("picked piece {}", idx);
            let mut piece = PartialPiece::new(idx, store.info().piece_length(idx));
            remaining -= piece.pick_next_blocks(remaining, &mut requests, current, false);
            partial_pieces.insert(idx, piece);
            store.set_requested(idx);
        }

        if remaining > 0 && self.in_endgame(store, &partial_pieces) {
            for idx in partials {
                if remaining == 0 {
                    break;
                }
                if let Some(piece) = partial_pieces.get_mut(&idx) {
                    remaining -= piece.pick_next_blocks(remaining, &mut requests, current, true);
                }
            }
        }
        requests
    }

    // Endgame once every wanted piece left is already being downloaded
    // and few enough of them remain.
    fn in_endgame(&self, store: &PieceStore, partial_pieces: &HashMap<usize, PartialPiece>) -> bool {
        let remaining = store.wanted_remaining();
        if remaining == 0 {
            return false;
        }
        let all_picked = store.with_priorities(|p| {
            p.iter()
                .enumerate()
                .filter(|(idx, p)| **p > Priority::None && !store.has_piece(*idx))
                .all(|(idx, _)| partial_pieces.get(&idx).map_or(false, |piece| !piece.has_free_blocks()))
        });
        let threshold = ((store.num_wanted() as f64 * self.endgame_ratio).floor() as usize).max(1);
        all_picked && remaining <= threshold
    }

    // Returns blocks a peer will no longer deliver, so others can pick them.
    pub async fn free_blocks<'a>(&self, blocks: impl IntoIterator<Item = &'a BlockInfo>) {
        let mut partial_pieces = self.partial_pieces.write().await;
        for block in blocks {
            if let Some(piece) = partial_pieces.get_mut(&block.piece_idx) {
                piece.free_block(block);
            }
        }
    }

    // Returns whether the block was a duplicate.
    pub async fn received_block(&self, block: &BlockInfo) -> bool {
        match self.partial_pieces.write().await.get_mut(&block.piece_idx) {
            Some(piece) => piece.received_block(block),
            None => true,
        }
    }

    pub async fn piece_verified(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
    }

    // Piece failed its hash check, all of its blocks must be downloaded again.
    pub async fn piece_failed(&self, idx: usize) {
        if let Some(piece) = self.partial_pieces.write().await.get_mut(&idx) {
            piece.free_all_blocks();
        }
    }
}
