use crate::BLOCK_SIZE;

// Largest block a remote peer may request from us (128KiB), anything above is a violation.
pub const MAX_REQUEST_LEN: usize = 0x20000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    // Index of piece that the block is contained in.
    pub piece_idx: usize,

    // Offset in bytes of block within piece.
    pub offset: usize,

    // Data of block.
    pub data: Vec<u8>,
}

impl BlockData {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.len(),
        }
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {
    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    // Whether a request for this block fits inside a piece of the given length.
    pub fn fits_in(&self, piece_len: usize) -> bool {
        self.len > 0
            && self.len <= MAX_REQUEST_LEN
            && self.offset.checked_add(self.len).map_or(false, |end| end <= piece_len)
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> usize {
    (piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        assert_eq!(block_len(normal_piece_len, 0), 16_384);
        assert_eq!(block_len(normal_piece_len, 1), 16_384);
        assert_eq!(block_len(last_piece_len, 0), 16_384);
        assert_eq!(block_len(last_piece_len, 1), 8546);
    }

    #[test]
    fn test_num_blocks() {
        (0..12).for_each(|i| assert_eq!(num_blocks(BLOCK_SIZE * i), i));
        assert_eq!(num_blocks(BLOCK_SIZE + 500), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000), 6);
        assert_eq!(num_blocks(0), 0);
    }

    #[test]
    fn test_request_fits_in_piece() {
        let block = BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: BLOCK_SIZE };
        assert!(block.fits_in(2 * BLOCK_SIZE));
        assert!(!block.fits_in(BLOCK_SIZE + 10));
        let empty = BlockInfo { piece_idx: 0, offset: 0, len: 0 };
        assert!(!empty.fits_in(BLOCK_SIZE));
        let huge = BlockInfo { piece_idx: 0, offset: 0, len: MAX_REQUEST_LEN + 1 };
        assert!(!huge.fits_in(usize::MAX));
    }
}
