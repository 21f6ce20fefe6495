mod block;
mod config;
mod de;
mod events;
mod fs;
mod magnet;
mod metadata;
mod metainfo;
mod p2p;
mod picker;
mod pieces;
mod resume;
mod server;
mod session;
mod store;
mod stream;
mod swarm;
mod torrent;
mod tracker;
pub mod stats;

// Most commonly used block size - 16KB.
pub const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20 byte SHA1 info hash.
pub type ID = [u8; 20];

// Opaque identifier of a torrent within a session, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorrentHandle(u64);

// Opaque identifier of a stream within a session, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(u64);

impl std::fmt::Display for TorrentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "torrent#{}", self.0)
    }
}

impl std::fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

// Re-exports
pub use config::{Config, peer_id};
pub use events::{CallbackHandle, StreamEvent, TorrentEvent};
pub use magnet::{Magnet, MagnetError};
pub use metainfo::{MetaInfo, MetaInfoError};
pub use pieces::{PieceState, Priority};
pub use server::{ServerError, StreamServer};
pub use session::{AddTorrentOptions, Session, SessionError, StorageKind, TorrentMode, TorrentSource};
pub use stats::DownloadStatus;
pub use store::FileInfo;
pub use stream::{FileSelector, StreamError, StreamState, TorrentStream};
pub use torrent::{TorrentError, TorrentState};
