mod piece;
mod priority;
mod store;

pub use piece::{PieceState, Priority};
pub use priority::{Priorities, StreamWindow};
pub use store::{PieceOutcome, PieceStore, StoreError};
