use std::collections::HashSet;
use crate::{block::*, BLOCK_SIZE};

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {

    // Block has not been requested.
    #[default]
    Free,

    // Block has been requested by at least 1 peer.
    Requested,

    Received,

}

// Piece with some of its blocks requested.
#[derive(Debug)]
pub struct PartialPiece {

    pub idx: usize,

    pub len: usize,

    pub block_states: Vec<BlockState>,

}

impl PartialPiece {

    pub fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            block_states: vec![BlockState::default(); num_blocks(len)],
        }
    }

    fn block(&self, i: usize) -> BlockInfo {
        BlockInfo {
            piece_idx: self.idx,
            offset: i * BLOCK_SIZE,
            len: block_len(self.len, i),
        }
    }

    // Returns a requested block to the pool so another peer can pick it.
    pub fn free_block(&mut self, block: &BlockInfo) {
        debug_assert_eq!(block.piece_idx, self.idx);
        if let Some(state) = self.block_states.get_mut(block.idx_in_piece()) {
            if *state == BlockState::Requested {
                *state = BlockState::Free;
            }
        }
    }

    pub fn free_all_blocks(&mut self) {
        self.block_states.iter_mut().for_each(|b| *b = BlockState::Free)
    }

    // Returns whether the block is a duplicate (already received).
    pub fn received_block(&mut self, block: &BlockInfo) -> bool {
        match self.block_states.get_mut(block.idx_in_piece()) {
            Some(state) if *state == BlockState::Received => true,
            Some(state) => {
                *state = BlockState::Received;
                false
            }
            None => true,
        }
    }

    pub fn has_free_blocks(&self) -> bool {
        self.block_states.contains(&BlockState::Free)
    }

    // Picks free blocks in order, in endgame blocks requested by other peers
    // are picked as well unless already in prev.
    pub fn pick_next_blocks(
        &mut self,
        num: usize,
        buf: &mut Vec<BlockInfo>,
        prev: &HashSet<BlockInfo>,
        endgame: bool,
    ) -> usize {
        let mut num_picked = 0;
        for i in 0..self.block_states.len() {
            if num_picked == num {
                break;
            }
            let block = self.block(i);
            match self.block_states[i] {
                BlockState::Free if !prev.contains(&block) => {
                    self.block_states[i] = BlockState::Requested;
                }
                BlockState::Requested if endgame && !prev.contains(&block) && !buf.contains(&block) => {}
                _ => continue,
            }
            buf.push(block);
            num_picked += 1;
        }
        num_picked
    }
}
