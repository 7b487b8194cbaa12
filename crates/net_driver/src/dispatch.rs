//! Inbound side: events the loop hands to the application.
//!
//! The loop pushes into an unbounded channel and never waits on the
//! application; the application drains [`InboundEvents`] whenever it wants.

use std::{
    collections::BTreeSet,
    sync::{Arc, PoisonError, RwLock},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::mpsc::{
    error::TryRecvError, unbounded_channel, UnboundedReceiver, UnboundedSender,
};
use tracing::{debug, trace};

use crate::{error::DisconnectReason, ids::PeerId};

/// Something the application has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Raw payload, untouched. `origin_is_server` is true when it arrived on
    /// the server endpoint (a client sent it to us as host).
    MessageReceived { payload: Bytes, origin_is_server: bool },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    /// The connection to the remote server ended without us asking for it.
    LocalDisconnected { reason: DisconnectReason },
    /// Hosting is up and our own client is connected to it.
    ServerStarted { local_peer: PeerId },
    /// Joined a remote server; time to send the connection request.
    ConnectedToServer { local_peer: PeerId },
    ConnectFailed { reason: DisconnectReason },
    ServerStartFailed { reason: String },
}

/// Application-side receiver of [`InboundEvent`]s.
#[derive(Debug)]
pub struct InboundEvents {
    rx: UnboundedReceiver<InboundEvent>,
}

impl InboundEvents {
    /// Next event if one is waiting.
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued, in production order.
    pub fn drain(&mut self) -> Vec<InboundEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Waits up to `timeout` for the next event.
    ///
    /// Must not be called from inside an async runtime.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<InboundEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) if Instant::now() >= deadline => return None,
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    /// Skips events until one satisfies `accept`, or `timeout` passes.
    pub fn recv_matching<F>(&mut self, timeout: Duration, mut accept: F) -> Option<InboundEvent>
    where
        F: FnMut(&InboundEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self.recv_timeout(remaining)?;
            if accept(&event) {
                return Some(event);
            }
            trace!(?event, "skipping inbound event");
        }
    }
}

/// Peers the local server has seen connect and not yet seen leave.
///
/// Written only by the loop thread, readable anywhere.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<BTreeSet<PeerId>>>,
}

impl PeerRegistry {
    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&peer)
    }

    pub fn snapshot(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub(crate) fn insert(&self, peer: PeerId) -> bool {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer)
    }

    pub(crate) fn remove(&self, peer: PeerId) -> bool {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer)
    }

    pub(crate) fn clear(&self) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Loop-side producer. Applies the peer bookkeeping before anything is
/// published.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    tx: UnboundedSender<InboundEvent>,
    registry: PeerRegistry,
}

/// Creates the inbound channel. The sender outlives individual loop runs so
/// one [`InboundEvents`] serves every restart of the network thread.
pub(crate) fn inbound_channel() -> (UnboundedSender<InboundEvent>, InboundEvents) {
    let (tx, rx) = unbounded_channel();
    (tx, InboundEvents { rx })
}

impl Dispatcher {
    pub(crate) fn new(tx: UnboundedSender<InboundEvent>, registry: PeerRegistry) -> Self {
        Self { tx, registry }
    }

    pub(crate) fn publish(&self, event: InboundEvent) {
        if self.tx.send(event).is_err() {
            trace!("inbound receiver dropped; event discarded");
        }
    }

    pub(crate) fn message(&self, payload: Bytes, origin_is_server: bool) {
        self.publish(InboundEvent::MessageReceived {
            payload,
            origin_is_server,
        });
    }

    /// Registers a peer on the local server. The host's own loopback client
    /// is registered too, but announced only through `ServerStarted`.
    pub(crate) fn peer_connected(&self, peer: PeerId, local: Option<PeerId>) {
        if !self.registry.insert(peer) {
            debug!(peer = %peer, "peer connected twice; ignoring");
            return;
        }
        if local == Some(peer) {
            return;
        }
        self.publish(InboundEvent::PeerConnected { peer });
    }

    /// Registers a peer without announcing it. Returns false if it was
    /// already known.
    pub(crate) fn register_quietly(&self, peer: PeerId) -> bool {
        self.registry.insert(peer)
    }

    /// Removes a peer that was never announced.
    pub(crate) fn forget_quietly(&self, peer: PeerId) {
        self.registry.remove(peer);
    }

    /// Handles a peer leaving the local server.
    ///
    /// Our own id never produces an event, and neither does an id that is
    /// not (or no longer) registered.
    pub(crate) fn peer_left(&self, peer: PeerId, local: Option<PeerId>) {
        let known = self.registry.remove(peer);
        if local == Some(peer) {
            debug!(peer = %peer, "own client left the hosted server");
            return;
        }
        if !known {
            debug!(peer = %peer, "disconnect for unknown peer suppressed");
            return;
        }
        self.publish(InboundEvent::PeerDisconnected { peer });
    }

    pub(crate) fn forget_peers(&self) {
        self.registry.clear();
    }
}
