use crate::Bitfield;

// Number of connected peers advertising each piece.
#[derive(Debug, Default)]
pub struct Availability {
    counts: Vec<u32>,
}

impl Availability {

    pub fn new(num_pieces: usize) -> Self {
        Self { counts: vec![0; num_pieces] }
    }

    pub fn add_bitfield(&mut self, bf: &Bitfield) {
        for idx in bf.iter_ones() {
            if let Some(c) = self.counts.get_mut(idx) {
                *c += 1;
            }
        }
    }

    // Called when a peer goes away with the pieces it had.
    pub fn remove_bitfield(&mut self, bf: &Bitfield) {
        for idx in bf.iter_ones() {
            if let Some(c) = self.counts.get_mut(idx) {
                *c = c.saturating_sub(1);
            }
        }
    }

    pub fn increment(&mut self, idx: usize) {
        if let Some(c) = self.counts.get_mut(idx) {
            *c += 1;
        }
    }

    pub fn get(&self, idx: usize) -> u32 {
        self.counts.get(idx).copied().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.counts
    }
}
