use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::PeerId;

/// Reliability tag honoured by the transport for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Unreliable,
    Reliable,
}

/// Serialized payload waiting in an outbound queue.
///
/// Immutable once queued; the loop thread consumes each one exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    payload: Bytes,
    delivery: DeliveryMode,
    target: Option<PeerId>,
    broadcast: bool,
}

impl OutboundMessage {
    /// Client-bound message, sent from the local client to the server it is connected to.
    pub fn to_server(payload: impl Into<Bytes>, delivery: DeliveryMode) -> Self {
        Self {
            payload: payload.into(),
            delivery,
            target: None,
            broadcast: false,
        }
    }

    /// Server-bound message addressed to a single peer.
    pub fn to_peer(peer: PeerId, payload: impl Into<Bytes>, delivery: DeliveryMode) -> Self {
        Self {
            payload: payload.into(),
            delivery,
            target: Some(peer),
            broadcast: false,
        }
    }

    /// Server-bound message for every connected peer.
    pub fn broadcast(payload: impl Into<Bytes>, delivery: DeliveryMode) -> Self {
        Self {
            payload: payload.into(),
            delivery,
            target: None,
            broadcast: true,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.delivery
    }

    pub fn target(&self) -> Option<PeerId> {
        self.target
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }
}
