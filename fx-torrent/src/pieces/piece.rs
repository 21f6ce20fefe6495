// Download state of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PieceState {
    #[default]
    Missing,
    // Blocks have been requested from at least one peer.
    Requested,
    // All blocks received, hash not checked yet.
    Downloaded,
    Verified,
}

// Download priority of a piece, higher is fetched sooner. None excludes the piece.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    None = 0,
    #[default]
    Normal = 1,
    High = 2,
    Readahead = 3,
    Next = 4,
    Now = 5,
}

impl From<u8> for Priority {
    fn from(v: u8) -> Self {
        match v {
            0 => Priority::None,
            1 => Priority::Normal,
            2 => Priority::High,
            3 => Priority::Readahead,
            4 => Priority::Next,
            _ => Priority::Now,
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}
