//! Lifecycle requests and their one-shot completions.
//!
//! Application threads never run a transition themselves. They post a
//! [`LifecycleRequest`] to the loop and get a [`Completion`] back; the loop
//! resolves it exactly once, after the whole transition (including any
//! connect handshake) has finished.

use std::{
    net::SocketAddr,
    thread,
    time::{Duration, Instant},
};

use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::trace;

use crate::{error::DisconnectReason, ids::PeerId};

/// How a lifecycle request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// Server listening, own client connected with this id.
    Started { local_peer: PeerId },
    /// Joined a remote server with this id.
    Connected { local_peer: PeerId },
    Stopped,
    Disconnected,
    AlreadyRunning,
    AlreadyConnected,
    NotRunning,
    /// The handshake did not complete; nothing was left half up.
    ConnectFailed(DisconnectReason),
    /// The server endpoint refused to listen.
    ListenFailed(String),
    /// The loop shut down before the request could finish.
    Cancelled,
}

impl LifecycleOutcome {
    /// True for outcomes that leave the requested state in place, including no-ops.
    pub fn is_success(&self) -> bool {
        !matches!(
            self,
            Self::ConnectFailed(_) | Self::ListenFailed(_) | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleCommand {
    StartServer,
    StopServer,
    Connect(SocketAddr),
    Disconnect,
}

#[derive(Debug)]
pub(crate) struct LifecycleRequest {
    pub(crate) command: LifecycleCommand,
    reply: oneshot::Sender<LifecycleOutcome>,
}

impl LifecycleRequest {
    pub(crate) fn new(command: LifecycleCommand) -> (Self, Completion) {
        let (reply, rx) = oneshot::channel();
        (Self { command, reply }, Completion { rx, outcome: None })
    }

    pub(crate) fn into_reply(self) -> Reply {
        Reply(self.reply)
    }
}

/// Sending half of a [`Completion`]; consumed on use so it fires once.
#[derive(Debug)]
pub(crate) struct Reply(oneshot::Sender<LifecycleOutcome>);

impl Reply {
    pub(crate) fn resolve(self, outcome: LifecycleOutcome) {
        if self.0.send(outcome).is_err() {
            trace!("lifecycle completion dropped by caller");
        }
    }
}

/// Which handshake the loop is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeKind {
    /// Own client connecting to the server we just started.
    Host,
    /// Client connecting to a remote server.
    Join,
}

/// The single in-flight connect. Taken exactly once, by whichever of
/// connected, failed, deadline or shutdown comes first.
#[derive(Debug)]
pub(crate) struct PendingHandshake {
    pub(crate) kind: HandshakeKind,
    pub(crate) reply: Reply,
    pub(crate) deadline: Instant,
}

/// Handle on the result of a lifecycle request.
///
/// Dropping it is fine; the transition still happens.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<LifecycleOutcome>,
    outcome: Option<LifecycleOutcome>,
}

impl Completion {
    /// Returns the outcome if the loop has finished the request.
    pub fn try_outcome(&mut self) -> Option<LifecycleOutcome> {
        if self.outcome.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(TryRecvError::Closed) => self.outcome = Some(LifecycleOutcome::Cancelled),
                Err(TryRecvError::Empty) => {}
            }
        }
        self.outcome.clone()
    }

    /// Blocks until the request finishes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> LifecycleOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        self.rx.blocking_recv().unwrap_or(LifecycleOutcome::Cancelled)
    }

    /// Blocks up to `timeout`; `None` if the request is still in flight.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<LifecycleOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.try_outcome() {
                return Some(outcome);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}
