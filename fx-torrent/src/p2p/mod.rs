use tokio::{net::TcpStream, sync::{mpsc, OwnedSemaphorePermit}};
use crate::{pieces::StoreError, ID};

mod extension;
mod handshake;
mod message;
mod session;
pub mod state;

pub use extension::{metadata_piece, ExtendedHandshake, MetadataMessage, METADATA_PIECE_LEN, UT_METADATA_ID};
pub use handshake::{Handshake, HandshakeCodec};
pub use message::{Message, MessageCodec};
pub use session::PeerSession;

use self::state::SessionState;

type Result<T, E = PeerError> = std::result::Result<T, E>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),

    #[error("bitfield sent after other messages")]
    UnexpectedBitfield,

    #[error("extension error: {0}")]
    Extension(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("connection timeout")]
    Timeout,

    #[error("no interest on either side")]
    IdleTimeout,
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands that can be sent to a peer.
#[derive(Debug)]
pub enum PeerCommand {

    // We verified a piece (piece idx).
    PieceWritten(usize),

    // Blocks became free or priorities changed, fill the request queue again.
    RequestMore,

    // End the peer session safely.
    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    pub id: Option<ID>,

    pub peer_tx: PeerTx,

    pub state: SessionState,

    pub session_handle: tokio::task::JoinHandle<()>,

}

impl PeerHandle {

    // Runs the session on its own task, the permit is held for the life of the connection.
    pub fn start_session(
        mut session: PeerSession,
        peer_tx: PeerTx,
        socket: Option<TcpStream>,
        permit: OwnedSemaphorePermit,
    ) -> PeerHandle {
        let handle = tokio::spawn(async move {
            session.start_session(socket).await;
            drop(permit);
        });
        PeerHandle {
            id: None,
            peer_tx,
            state: SessionState::default(),
            session_handle: handle,
        }
    }
}
