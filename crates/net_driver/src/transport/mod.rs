//! Transport capability consumed by the network loop.
//!
//! An endpoint never calls back into the driver. Whatever happened since the
//! last poll (handshakes, received payloads, disconnects) is reported through
//! the event buffer passed to `poll`, which the loop drains on its own
//! thread.

use std::{fmt::Debug, net::SocketAddr, time::Duration};

use bytes::Bytes;

use crate::{error::DisconnectReason, ids::PeerId, messages::DeliveryMode, TransportError};

pub mod memory;

pub use memory::{MemoryClient, MemoryNetwork, MemoryServer};

pub type TransportResult<T> = Result<T, TransportError>;

/// Retry budget for a single outgoing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

/// Activity on the client endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Handshake finished; the server assigned us `peer`.
    Connected { peer: PeerId },
    /// Every attempt failed; no connection exists.
    ConnectFailed { reason: DisconnectReason },
    /// An established connection ended.
    Disconnected { reason: DisconnectReason },
    Message { payload: Bytes },
}

/// Activity on the server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId, reason: DisconnectReason },
    Message { peer: PeerId, payload: Bytes },
}

/// Client role of a transport: one outgoing connection at a time.
pub trait ClientEndpoint: Send + Debug {
    /// Starts connecting. Completion is reported later as
    /// [`ClientEvent::Connected`] or [`ClientEvent::ConnectFailed`].
    fn connect(&mut self, addr: SocketAddr, policy: ConnectPolicy) -> TransportResult<()>;

    /// Closes the connection, or abandons a pending connect.
    fn disconnect(&mut self) -> TransportResult<()>;

    fn send(&mut self, payload: Bytes, mode: DeliveryMode) -> TransportResult<()>;

    fn poll(&mut self, events: &mut Vec<ClientEvent>) -> TransportResult<()>;
}

/// Server role of a transport: listens on a port and serves many peers.
pub trait ServerEndpoint: Send + Debug {
    fn start(&mut self, port: u16, max_peers: u16) -> TransportResult<()>;

    /// Stops listening and drops every peer.
    fn stop(&mut self) -> TransportResult<()>;

    fn send_to(&mut self, peer: PeerId, payload: Bytes, mode: DeliveryMode) -> TransportResult<()>;

    fn send_to_all(&mut self, payload: Bytes, mode: DeliveryMode) -> TransportResult<()>;

    fn poll(&mut self, events: &mut Vec<ServerEvent>) -> TransportResult<()>;
}

impl<T: ClientEndpoint + ?Sized> ClientEndpoint for Box<T> {
    fn connect(&mut self, addr: SocketAddr, policy: ConnectPolicy) -> TransportResult<()> {
        (**self).connect(addr, policy)
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        (**self).disconnect()
    }

    fn send(&mut self, payload: Bytes, mode: DeliveryMode) -> TransportResult<()> {
        (**self).send(payload, mode)
    }

    fn poll(&mut self, events: &mut Vec<ClientEvent>) -> TransportResult<()> {
        (**self).poll(events)
    }
}

impl<T: ServerEndpoint + ?Sized> ServerEndpoint for Box<T> {
    fn start(&mut self, port: u16, max_peers: u16) -> TransportResult<()> {
        (**self).start(port, max_peers)
    }

    fn stop(&mut self) -> TransportResult<()> {
        (**self).stop()
    }

    fn send_to(&mut self, peer: PeerId, payload: Bytes, mode: DeliveryMode) -> TransportResult<()> {
        (**self).send_to(peer, payload, mode)
    }

    fn send_to_all(&mut self, payload: Bytes, mode: DeliveryMode) -> TransportResult<()> {
        (**self).send_to_all(payload, mode)
    }

    fn poll(&mut self, events: &mut Vec<ServerEvent>) -> TransportResult<()> {
        (**self).poll(events)
    }
}
