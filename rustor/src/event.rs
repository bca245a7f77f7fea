use std::net::SocketAddr;
use tokio::sync::mpsc;

pub type EventTx = mpsc::UnboundedSender<Event>;
pub type EventRx = mpsc::UnboundedReceiver<Event>;

/// Notifications a controller emits towards its host. Each variant carries
/// exactly the payload its subscribers need; there is no dynamic registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {

    /// A piece finished downloading and its SHA-1 checked out.
    PieceComplete(u32),

    /// A piece finished downloading but failed its SHA-1 and was dropped.
    PieceDiscarded(u32),

    /// Every piece is complete and valid.
    Complete,

    /// The active tracker failed; retry is scheduled with backoff.
    TrackerLost(String),

    /// An announce succeeded.
    TrackerOk(String),

    PeerConnected(SocketAddr),

    PeerDisconnected(SocketAddr),

}
