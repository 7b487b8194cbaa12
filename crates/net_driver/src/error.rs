use thiserror::Error;

use crate::{codec::CodecError, config::ConfigError, ids::PeerId, queue::QueueError};

/// Reasons why a connection ended or never came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed on request by either side.
    Graceful,
    /// The remote stopped answering, or every connect attempt ran out of time.
    TimedOut,
    /// Nothing was listening at the target, or the server turned us away.
    Refused,
    /// The server is at its peer limit.
    ServerFull,
    /// The server endpoint shut down.
    ServerStopped,
    TransportError,
}

/// Failure reported by a transport endpoint.
///
/// The loop absorbs all of these; they only ever show up in logs or as
/// failure outcomes.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint not ready")]
    NotReady,
    #[error("endpoint is not connected")]
    NotConnected,
    #[error("a connection is already open or pending")]
    AlreadyConnected,
    #[error("endpoint is already listening")]
    AlreadyListening,
    #[error("address {0} is already in use")]
    AddrInUse(std::net::SocketAddr),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

/// Errors surfaced by [`NetworkDriver`](crate::NetworkDriver) to application threads.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("network thread is not running")]
    ThreadNotRunning,
    #[error("network thread is already running")]
    AlreadyRunning,
    #[error("outbound queue rejected message: {0}")]
    Queue(#[from] QueueError),
    #[error("could not resolve connection code: {0}")]
    Codec(#[from] CodecError),
    #[error("failed to spawn network thread: {0}")]
    Spawn(std::io::Error),
    #[error("network thread panicked")]
    Panicked,
    #[error("invalid driver configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("server message needs a target peer or the broadcast flag")]
    MissingTarget,
}
