//! Network driver for peer-hosted sessions.
//!
//! One background thread owns a client endpoint and a server endpoint. Any
//! thread may queue outbound payloads or request lifecycle transitions; the
//! loop thread is the only one that ever touches the endpoints. Inbound bytes
//! and lifecycle notifications come back through [`InboundEvents`].
//!
//! - codec: resolution of shareable connection codes to addresses
//! - config: driver configuration (TOML loadable)
//! - dispatch: inbound event queue and known-peer registry
//! - driver: the network loop and its public handle
//! - queue: bounded multi-producer outbound queues
//! - transport: endpoint capability traits and the in-memory transport

use std::time::Duration;

/// Resolution of connection strings to network addresses
pub mod codec;
/// Driver configuration
pub mod config;
/// Inbound events handed to the application
pub mod dispatch;
/// The network loop and the handle application threads talk to
pub mod driver;
/// Shared error types
pub mod error;
/// Peer identifiers
pub mod ids;
/// Outbound message wrappers
pub mod messages;
/// Outbound queues drained by the loop
pub mod queue;
/// Transport capability traits and implementations
pub mod transport;

/// Port the host listens on and clients connect to unless configured otherwise.
pub const DEFAULT_PORT: u16 = 7777;
/// Maximum number of peers accepted by a hosted server.
pub const DEFAULT_MAX_PEERS: u16 = 256;
/// Connect attempts before a connection is abandoned.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
/// Time granted to each connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1_000);
/// Pause between two loop iterations.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

pub use codec::{AddressCodec, CodecError, NoCodec};
pub use config::{ConfigError, DriverConfig, OverflowPolicy, QueueConfig};
pub use dispatch::{InboundEvent, InboundEvents};
pub use driver::{Completion, LifecycleOutcome, NetworkDriver};
pub use error::{DisconnectReason, DriverError, TransportError};
pub use ids::PeerId;
pub use messages::{DeliveryMode, OutboundMessage};
pub use queue::{OutboundQueue, PushOutcome, QueueError};
pub use transport::{ClientEndpoint, ClientEvent, ConnectPolicy, ServerEndpoint, ServerEvent};
