//! Public handle on the network thread.
//!
//! [`NetworkDriver`] is what application code holds. It is `Sync`, so any
//! number of threads can share it behind an `Arc`: sends go into the
//! outbound queues, lifecycle calls go into the command queue, and status
//! reads are plain atomic loads. Only the loop thread (see [`worker`])
//! touches the endpoints.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::{
    codec::{resolve_target, AddressCodec, NoCodec},
    config::{DriverConfig, QueueConfig},
    dispatch::{inbound_channel, Dispatcher, InboundEvent, InboundEvents, PeerRegistry},
    error::DriverError,
    ids::PeerId,
    messages::{DeliveryMode, OutboundMessage},
    queue::{OutboundQueue, PushOutcome, QueueError},
    transport::{ClientEndpoint, ServerEndpoint},
};

mod lifecycle;
mod worker;

pub use lifecycle::{Completion, LifecycleOutcome};

use lifecycle::{LifecycleCommand, LifecycleRequest};
use worker::NetworkLoop;

const NO_PEER: u32 = u32::MAX;

/// State shared between the handle and the loop thread.
///
/// The flags are written by the loop only; the queues have many producers
/// and the loop as their single consumer.
#[derive(Debug)]
pub(crate) struct Shared {
    run: AtomicBool,
    server_running: AtomicBool,
    client_connected: AtomicBool,
    local_peer: AtomicU32,
    pub(crate) client_queue: OutboundQueue<OutboundMessage>,
    pub(crate) server_queue: OutboundQueue<OutboundMessage>,
    pub(crate) commands: OutboundQueue<LifecycleRequest>,
    registry: PeerRegistry,
}

impl Shared {
    fn new(config: &DriverConfig) -> Self {
        let commands = OutboundQueue::new(QueueConfig::unbounded());
        // Closed until a loop is there to consume it.
        commands.close();
        Self {
            run: AtomicBool::new(false),
            server_running: AtomicBool::new(false),
            client_connected: AtomicBool::new(false),
            local_peer: AtomicU32::new(NO_PEER),
            client_queue: OutboundQueue::new(config.client_queue),
            server_queue: OutboundQueue::new(config.server_queue),
            commands,
            registry: PeerRegistry::default(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.run.load(Ordering::Acquire)
    }

    pub(crate) fn set_server_running(&self, value: bool) {
        self.server_running.store(value, Ordering::Release);
    }

    pub(crate) fn set_client_connected(&self, value: bool) {
        self.client_connected.store(value, Ordering::Release);
    }

    pub(crate) fn local_peer(&self) -> Option<PeerId> {
        match self.local_peer.load(Ordering::Acquire) {
            NO_PEER => None,
            raw => Some(PeerId::new(raw as u16)),
        }
    }

    pub(crate) fn set_local_peer(&self, peer: Option<PeerId>) {
        let raw = peer.map_or(NO_PEER, |peer| u32::from(peer.get()));
        self.local_peer.store(raw, Ordering::Release);
    }
}

/// Handle on the network thread of one session.
pub struct NetworkDriver {
    config: DriverConfig,
    shared: Arc<Shared>,
    codec: Box<dyn AddressCodec>,
    events_tx: UnboundedSender<InboundEvent>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDriver")
            .field("port", &self.config.port)
            .field("thread_alive", &self.is_thread_alive())
            .field("server_running", &self.is_server_running())
            .field("client_connected", &self.is_client_connected())
            .finish()
    }
}

impl NetworkDriver {
    /// Creates the driver without starting its thread.
    ///
    /// The returned [`InboundEvents`] stays valid across thread restarts.
    pub fn new(config: DriverConfig) -> Result<(Self, InboundEvents), DriverError> {
        config.validate()?;
        let (events_tx, events) = inbound_channel();
        let driver = Self {
            shared: Arc::new(Shared::new(&config)),
            config,
            codec: Box::new(NoCodec),
            events_tx,
            thread: Mutex::new(None),
        };
        Ok((driver, events))
    }

    /// Replaces the codec used for non-literal connection strings.
    pub fn with_codec(mut self, codec: impl AddressCodec + 'static) -> Self {
        self.codec = Box::new(codec);
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn thread_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the network thread, handing it ownership of both endpoints.
    ///
    /// If a previous thread was asked to stop but has not exited yet, this
    /// waits for it first so two loops never run at once.
    pub fn start_thread<C, S>(&self, client: C, server: S) -> Result<(), DriverError>
    where
        C: ClientEndpoint + 'static,
        S: ServerEndpoint + 'static,
    {
        let mut slot = self.thread_slot();
        if let Some(handle) = slot.take() {
            if !handle.is_finished() && self.shared.is_running() {
                *slot = Some(handle);
                return Err(DriverError::AlreadyRunning);
            }
            if handle.join().is_err() {
                warn!("previous network thread panicked");
            }
        }

        let dispatcher = Dispatcher::new(self.events_tx.clone(), self.shared.registry.clone());
        let network_loop = NetworkLoop::new(
            client,
            server,
            Arc::clone(&self.shared),
            dispatcher,
            self.config.clone(),
        );

        self.shared.commands.reopen();
        self.shared.run.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name("net-driver".into())
            .spawn(move || network_loop.run());

        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                debug!("network thread spawned");
                Ok(())
            }
            Err(err) => {
                self.shared.run.store(false, Ordering::Release);
                self.shared.commands.close();
                Err(DriverError::Spawn(err))
            }
        }
    }

    /// Asks the loop to stop. It exits after the iteration in progress and
    /// tears the endpoints down; use [`join`](Self::join) to wait for that.
    pub fn kill_thread(&self) {
        if self.shared.run.swap(false, Ordering::AcqRel) {
            info!("network thread stop requested");
        }
    }

    /// Waits for the network thread to exit. Returns immediately if there is none.
    pub fn join(&self) -> Result<(), DriverError> {
        let handle = self.thread_slot().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| DriverError::Panicked),
            None => Ok(()),
        }
    }

    /// Stops the loop and waits for teardown to finish.
    pub fn shutdown(&self) -> Result<(), DriverError> {
        self.kill_thread();
        self.join()
    }

    pub fn is_thread_alive(&self) -> bool {
        self.thread_slot()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn is_server_running(&self) -> bool {
        self.shared.server_running.load(Ordering::Acquire)
    }

    pub fn is_client_connected(&self) -> bool {
        self.shared.client_connected.load(Ordering::Acquire)
    }

    /// Id the server assigned to our own client, while connected.
    pub fn local_peer(&self) -> Option<PeerId> {
        self.shared.local_peer()
    }

    /// Peers currently connected to the local server, our own client included.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.registry.snapshot()
    }

    fn request(&self, command: LifecycleCommand) -> Result<Completion, DriverError> {
        let (request, completion) = LifecycleRequest::new(command);
        match self.shared.commands.push(request) {
            Ok(_) => Ok(completion),
            Err(QueueError::Closed) => Err(DriverError::ThreadNotRunning),
        }
    }

    /// Starts hosting: listen on the configured port, then connect our own
    /// client to it.
    pub fn start_server(&self) -> Result<Completion, DriverError> {
        self.request(LifecycleCommand::StartServer)
    }

    pub fn stop_server(&self) -> Result<Completion, DriverError> {
        self.request(LifecycleCommand::StopServer)
    }

    /// Joins a remote server by literal address or shareable code.
    ///
    /// The code is decoded here, on the caller's thread, so a bad code is
    /// reported immediately.
    pub fn connect_to_server(&self, code: &str) -> Result<Completion, DriverError> {
        let addr = resolve_target(code, self.config.port, self.codec.as_ref())?;
        self.request(LifecycleCommand::Connect(addr))
    }

    /// Leaves whatever session is active. Safe from any state.
    pub fn disconnect(&self) -> Result<Completion, DriverError> {
        self.request(LifecycleCommand::Disconnect)
    }

    /// Queues a message for the client endpoint. Works before the thread starts.
    pub fn enqueue_client(
        &self,
        message: OutboundMessage,
    ) -> Result<PushOutcome<OutboundMessage>, DriverError> {
        Ok(self.shared.client_queue.push(message)?)
    }

    /// Queues a message for the server endpoint; it must name a peer or be a broadcast.
    pub fn enqueue_server(
        &self,
        message: OutboundMessage,
    ) -> Result<PushOutcome<OutboundMessage>, DriverError> {
        if message.target().is_none() && !message.is_broadcast() {
            return Err(DriverError::MissingTarget);
        }
        Ok(self.shared.server_queue.push(message)?)
    }

    pub fn send_to_server(
        &self,
        payload: impl Into<Bytes>,
        mode: DeliveryMode,
    ) -> Result<PushOutcome<OutboundMessage>, DriverError> {
        self.enqueue_client(OutboundMessage::to_server(payload, mode))
    }

    pub fn send_to_peer(
        &self,
        peer: PeerId,
        payload: impl Into<Bytes>,
        mode: DeliveryMode,
    ) -> Result<PushOutcome<OutboundMessage>, DriverError> {
        self.enqueue_server(OutboundMessage::to_peer(peer, payload, mode))
    }

    pub fn broadcast(
        &self,
        payload: impl Into<Bytes>,
        mode: DeliveryMode,
    ) -> Result<PushOutcome<OutboundMessage>, DriverError> {
        self.enqueue_server(OutboundMessage::broadcast(payload, mode))
    }

    /// Messages waiting in the client and server queues.
    pub fn queued(&self) -> (usize, usize) {
        (self.shared.client_queue.len(), self.shared.server_queue.len())
    }
}

impl Drop for NetworkDriver {
    fn drop(&mut self) {
        self.kill_thread();
        if self.join().is_err() {
            warn!("network thread panicked during shutdown");
        }
    }
}
