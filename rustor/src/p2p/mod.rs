use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use crate::block::BlockInfo;
use crate::rate::RateMeter;
use crate::ID;

pub mod handshake;
pub mod message;
pub mod session;

type Result<T> = std::result::Result<T, PeerError>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

// Request pipelining: refill claims when in-flight drops below the floor,
// up to the ceiling.
pub const MIN_REQUESTS: usize = 2;
pub const MAX_REQUESTS: usize = 5;

// A requested block unanswered for this long goes back to the pool.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no controller for offered info-hash")]
    UnknownInfoHash,

    #[error("peer is ourselves")]
    SelfConnection,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("message {id} with invalid payload length {len}")]
    InvalidPayload { id: u8, len: usize },

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("bitfield of {got} bits, expected {expected}")]
    BitfieldSize { got: usize, expected: usize },

    #[error("bitfield after first message")]
    UnexpectedBitfield,

    #[error("have with piece index {0} out of range")]
    BadPieceIndex(u32),

    #[error("connection timeout")]
    Timeout,

    #[error("channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        PeerError::ChannelClosed
    }
}

/// Commands a controller sends into a peer session.
pub enum PeerCommand {

    /// Desired choke state; a message goes out only on transition.
    Choke(bool),

    /// Announce a freshly completed piece.
    HavePiece(u32),

    /// Drop a wanted block; a cancel goes out if it was requested.
    Cancel(BlockInfo),

    KeepAlive,

    /// One metered dispatch pass; replies with (bytes requested,
    /// bytes sent).
    Dispatch {
        dl_budget: u64,
        ul_budget: u64,
        reply: oneshot::Sender<(u64, u64)>,
    },

    Shutdown,

}

/// Session state shared with the controller: the four protocol booleans,
/// timestamps and rate meters the policy engine reads.
#[derive(Debug)]
pub struct PeerState {

    pub running: bool,

    pub peer_id: Option<ID>,

    pub am_choking: bool,

    pub am_interested: bool,

    pub peer_choking: bool,

    pub peer_interested: bool,

    pub connected_at: Option<Instant>,

    pub last_send: Option<Instant>,

    pub last_recv: Option<Instant>,

    pub last_block_recv: Option<Instant>,

    pub last_block_send: Option<Instant>,

    pub download: RateMeter,

    pub upload: RateMeter,

}

impl Default for PeerState {
    fn default() -> PeerState {
        PeerState {
            running: false,
            peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            connected_at: None,
            last_send: None,
            last_recv: None,
            last_block_recv: None,
            last_block_send: None,
            download: RateMeter::new(),
            upload: RateMeter::new(),
        }
    }
}

pub type SharedPeerState = Arc<Mutex<PeerState>>;

pub(crate) fn lock_state(state: &SharedPeerState) -> MutexGuard<'_, PeerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// The controller's grip on one running session.
pub struct PeerHandle {

    pub addr: SocketAddr,

    pub peer_tx: PeerTx,

    pub join: JoinHandle<()>,

    pub state: SharedPeerState,

    // When the session task was spawned; drives youngest-first policies.
    pub started_at: Instant,

}

impl PeerHandle {
    pub fn shutdown(&self) {
        self.peer_tx.send(PeerCommand::Shutdown).ok();
    }
}
