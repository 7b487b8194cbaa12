//! Transport-assigned peer identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Short identifier the server endpoint assigns to each connected peer.
///
/// Only meaningful within one server session; ids may be reused once a peer
/// has left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(u16);

impl PeerId {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u16> for PeerId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}
