//! The network loop.
//!
//! [`NetworkLoop`] owns both endpoints by value. Nothing else can reach
//! them, so every send, poll, connect and stop happens on the loop thread.

use std::{
    net::{Ipv4Addr, SocketAddr},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Instant,
};

use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use super::{
    lifecycle::{HandshakeKind, LifecycleCommand, LifecycleOutcome, PendingHandshake, Reply},
    Shared,
};
use crate::{
    config::DriverConfig,
    dispatch::{Dispatcher, InboundEvent},
    error::{DisconnectReason, TransportError},
    ids::PeerId,
    messages::OutboundMessage,
    transport::{
        ClientEndpoint, ClientEvent, ConnectPolicy, ServerEndpoint, ServerEvent, TransportResult,
    },
};

/// Lifecycle of one endpoint as seen by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointPhase {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

pub(crate) struct NetworkLoop<C, S> {
    client: C,
    server: S,
    client_phase: EndpointPhase,
    server_phase: EndpointPhase,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    config: DriverConfig,
    pending: Option<PendingHandshake>,
    /// Peers accepted by the server while the host handshake is in flight.
    /// Which of them is our own client is unknown until it completes.
    held_peers: Vec<PeerId>,
    client_events: Vec<ClientEvent>,
    server_events: Vec<ServerEvent>,
}

impl<C, S> NetworkLoop<C, S>
where
    C: ClientEndpoint,
    S: ServerEndpoint,
{
    pub(crate) fn new(
        client: C,
        server: S,
        shared: Arc<Shared>,
        dispatcher: Dispatcher,
        config: DriverConfig,
    ) -> Self {
        Self {
            client,
            server,
            client_phase: EndpointPhase::Uninitialized,
            server_phase: EndpointPhase::Uninitialized,
            shared,
            dispatcher,
            config,
            pending: None,
            held_peers: Vec::new(),
            client_events: Vec::new(),
            server_events: Vec::new(),
        }
    }

    /// Thread body: initialize, iterate until the run flag drops, tear down.
    pub(crate) fn run(mut self) {
        let span = info_span!("net_driver", session = %Uuid::new_v4());
        let _guard = span.enter();

        self.initialize();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_until_stopped()));
        if result.is_err() {
            error!("network loop panicked; tearing down endpoints");
        }
        self.teardown();
        info!("network thread stopped");
    }

    fn initialize(&mut self) {
        self.client_phase = EndpointPhase::Initialized;
        self.server_phase = EndpointPhase::Initialized;
        info!(
            port = self.config.port,
            max_peers = self.config.max_peers,
            "network loop started"
        );
    }

    fn run_until_stopped(&mut self) {
        let tick = self.config.tick();
        while self.shared.is_running() {
            self.iterate();
            if !tick.is_zero() {
                thread::sleep(tick);
            }
        }
    }

    /// One bounded unit of work: at most one lifecycle command, one client
    /// send, one server send and one poll per endpoint.
    fn iterate(&mut self) {
        self.expire_handshake();
        self.apply_next_command();
        self.flush_client_queue();
        self.flush_server_queue();
        self.poll_client();
        self.poll_server();
    }

    fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            max_attempts: self.config.connect_attempts,
            attempt_timeout: self.config.connect_timeout(),
        }
    }

    fn apply_next_command(&mut self) {
        // A transition with a handshake in flight finishes before the next one starts.
        if self.pending.is_some() {
            return;
        }
        let Some(request) = self.shared.commands.try_pop() else {
            return;
        };
        let command = request.command;
        let reply = request.into_reply();
        debug!(?command, "applying lifecycle command");
        match command {
            LifecycleCommand::StartServer => self.start_server(reply),
            LifecycleCommand::StopServer => self.stop_server(reply),
            LifecycleCommand::Connect(addr) => self.connect(addr, reply),
            LifecycleCommand::Disconnect => self.disconnect(reply),
        }
    }

    fn start_server(&mut self, reply: Reply) {
        if self.server_phase == EndpointPhase::Running {
            reply.resolve(LifecycleOutcome::AlreadyRunning);
            return;
        }
        if self.client_phase == EndpointPhase::Running {
            info!("leaving current server before hosting");
            self.shutdown_client();
            self.reset_session();
            self.discard_queued("left server to host");
        }

        if let Err(err) = self.server.start(self.config.port, self.config.max_peers) {
            warn!(port = self.config.port, error = %err, "server failed to start listening");
            let reason = err.to_string();
            self.dispatcher.publish(InboundEvent::ServerStartFailed {
                reason: reason.clone(),
            });
            reply.resolve(LifecycleOutcome::ListenFailed(reason));
            return;
        }
        self.server_phase = EndpointPhase::Running;

        let loopback = SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.port));
        if let Err(err) = self.client.connect(loopback, self.connect_policy()) {
            warn!(error = %err, "host client failed to connect to own server");
            self.shutdown_server();
            self.fail_connect(reply, DisconnectReason::TransportError);
            return;
        }

        info!(port = self.config.port, "server listening; connecting host client");
        self.pending = Some(PendingHandshake {
            kind: HandshakeKind::Host,
            reply,
            deadline: Instant::now() + self.config.connect_deadline(),
        });
    }

    fn stop_server(&mut self, reply: Reply) {
        if self.server_phase != EndpointPhase::Running {
            reply.resolve(LifecycleOutcome::NotRunning);
            return;
        }
        self.shutdown_client();
        self.shutdown_server();
        self.reset_session();
        self.discard_queued("server stopped");
        info!("server stopped");
        reply.resolve(LifecycleOutcome::Stopped);
    }

    fn connect(&mut self, addr: SocketAddr, reply: Reply) {
        if self.client_phase == EndpointPhase::Running {
            reply.resolve(LifecycleOutcome::AlreadyConnected);
            return;
        }
        if let Err(err) = self.client.connect(addr, self.connect_policy()) {
            warn!(%addr, error = %err, "client failed to start connecting");
            self.fail_connect(reply, DisconnectReason::TransportError);
            return;
        }
        info!(%addr, "connecting to server");
        self.pending = Some(PendingHandshake {
            kind: HandshakeKind::Join,
            reply,
            deadline: Instant::now() + self.config.connect_deadline(),
        });
    }

    fn disconnect(&mut self, reply: Reply) {
        self.shutdown_client();
        self.shutdown_server();
        self.reset_session();
        self.discard_queued("disconnected");
        info!("disconnected");
        reply.resolve(LifecycleOutcome::Disconnected);
    }

    fn fail_connect(&mut self, reply: Reply, reason: DisconnectReason) {
        self.dispatcher
            .publish(InboundEvent::ConnectFailed { reason });
        reply.resolve(LifecycleOutcome::ConnectFailed(reason));
    }

    /// Gives up on a handshake the transport never finished.
    fn expire_handshake(&mut self) {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|pending| Instant::now() >= pending.deadline);
        if !expired {
            return;
        }
        if let Some(pending) = self.pending.take() {
            warn!(kind = ?pending.kind, "connect handshake timed out");
            self.abandon_handshake(pending, DisconnectReason::TimedOut);
        }
    }

    fn abandon_handshake(&mut self, pending: PendingHandshake, reason: DisconnectReason) {
        if let Err(err) = self.client.disconnect() {
            debug!(error = %err, "abandoning connect");
        }
        if pending.kind == HandshakeKind::Host {
            self.shutdown_server();
        }
        self.reset_session();
        self.fail_connect(pending.reply, reason);
    }

    fn complete_handshake(&mut self, peer: PeerId) {
        let Some(pending) = self.pending.take() else {
            warn!(peer = %peer, "unexpected connect completion; dropping connection");
            if let Err(err) = self.client.disconnect() {
                debug!(error = %err, "dropping unexpected connection");
            }
            return;
        };

        self.client_phase = EndpointPhase::Running;
        self.shared.set_local_peer(Some(peer));
        match pending.kind {
            HandshakeKind::Host => {
                self.shared.set_server_running(true);
                self.shared.set_client_connected(true);
                info!(local_peer = %peer, "server started");
                self.dispatcher
                    .publish(InboundEvent::ServerStarted { local_peer: peer });
                for held in std::mem::take(&mut self.held_peers) {
                    if held != peer {
                        self.dispatcher.publish(InboundEvent::PeerConnected { peer: held });
                    }
                }
                pending
                    .reply
                    .resolve(LifecycleOutcome::Started { local_peer: peer });
            }
            HandshakeKind::Join => {
                self.shared.set_client_connected(true);
                info!(local_peer = %peer, "connected to server");
                self.dispatcher
                    .publish(InboundEvent::ConnectedToServer { local_peer: peer });
                pending
                    .reply
                    .resolve(LifecycleOutcome::Connected { local_peer: peer });
            }
        }
    }

    fn flush_client_queue(&mut self) {
        let Some(message) = self.shared.client_queue.try_pop() else {
            return;
        };
        if let Err(err) = self
            .client
            .send(message.payload().clone(), message.delivery())
        {
            warn!(error = %err, mode = ?message.delivery(), "client send failed");
        }
    }

    fn flush_server_queue(&mut self) {
        let Some(message) = self.shared.server_queue.try_pop() else {
            return;
        };
        if let Err(err) = self.send_from_server(&message) {
            warn!(
                error = %err,
                target = ?message.target(),
                broadcast = message.is_broadcast(),
                "server send failed"
            );
        }
    }

    fn send_from_server(&mut self, message: &OutboundMessage) -> TransportResult<()> {
        let payload = message.payload().clone();
        if message.is_broadcast() {
            return self.server.send_to_all(payload, message.delivery());
        }
        match message.target() {
            Some(peer) => self.server.send_to(peer, payload, message.delivery()),
            None => Err(TransportError::Other(
                "server message has neither target nor broadcast flag".into(),
            )),
        }
    }

    fn poll_client(&mut self) {
        let mut events = std::mem::take(&mut self.client_events);
        if let Err(err) = self.client.poll(&mut events) {
            warn!(error = %err, "client poll failed");
        }
        for event in events.drain(..) {
            self.handle_client_event(event);
        }
        self.client_events = events;
    }

    fn poll_server(&mut self) {
        let mut events = std::mem::take(&mut self.server_events);
        if let Err(err) = self.server.poll(&mut events) {
            warn!(error = %err, "server poll failed");
        }
        for event in events.drain(..) {
            self.handle_server_event(event);
        }
        self.server_events = events;
    }

    fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { peer } => self.complete_handshake(peer),
            ClientEvent::ConnectFailed { reason } => match self.pending.take() {
                Some(pending) => {
                    warn!(?reason, kind = ?pending.kind, "connect failed");
                    self.abandon_handshake(pending, reason);
                }
                None => debug!(?reason, "connect failure with no handshake pending"),
            },
            ClientEvent::Disconnected { reason } => {
                if self.client_phase != EndpointPhase::Running {
                    debug!(?reason, "client disconnect echo ignored");
                    return;
                }
                warn!(?reason, "lost connection to server");
                self.client_phase = EndpointPhase::Stopped;
                // A host without its own client is not a usable session.
                if self.server_phase == EndpointPhase::Running {
                    self.shutdown_server();
                }
                self.reset_session();
                self.dispatcher
                    .publish(InboundEvent::LocalDisconnected { reason });
            }
            ClientEvent::Message { payload } => self.dispatcher.message(payload, false),
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::PeerConnected { peer } => {
                debug!(peer = %peer, "peer connected");
                if self.hosting_in_flight() {
                    if self.dispatcher.register_quietly(peer) {
                        self.held_peers.push(peer);
                    }
                    return;
                }
                self.dispatcher
                    .peer_connected(peer, self.shared.local_peer());
            }
            ServerEvent::PeerDisconnected { peer, reason } => {
                debug!(peer = %peer, ?reason, "peer disconnected");
                if let Some(index) = self.held_peers.iter().position(|held| *held == peer) {
                    self.held_peers.remove(index);
                    self.dispatcher.forget_quietly(peer);
                    return;
                }
                self.dispatcher.peer_left(peer, self.shared.local_peer());
            }
            ServerEvent::Message { payload, .. } => self.dispatcher.message(payload, true),
        }
    }

    fn hosting_in_flight(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.kind == HandshakeKind::Host)
    }

    fn shutdown_client(&mut self) {
        if self.client_phase != EndpointPhase::Running {
            return;
        }
        if let Err(err) = self.client.disconnect() {
            debug!(error = %err, "client disconnect");
        }
        self.client_phase = EndpointPhase::Stopped;
    }

    fn shutdown_server(&mut self) {
        if self.server_phase != EndpointPhase::Running {
            return;
        }
        if let Err(err) = self.server.stop() {
            warn!(error = %err, "server stop failed");
        }
        self.server_phase = EndpointPhase::Stopped;
    }

    /// Back to "nothing running": both flags false, no identity, no peers.
    fn reset_session(&mut self) {
        self.shared.set_server_running(false);
        self.shared.set_client_connected(false);
        self.shared.set_local_peer(None);
        self.dispatcher.forget_peers();
        self.held_peers.clear();
    }

    fn discard_queued(&self, why: &str) {
        let client = self.shared.client_queue.clear();
        let server = self.shared.server_queue.clear();
        if client + server > 0 {
            debug!(client, server, why, "discarded queued outbound messages");
        }
    }

    /// Runs exactly once, after the last iteration.
    fn teardown(&mut self) {
        self.shared.commands.close();
        if let Some(pending) = self.pending.take() {
            if let Err(err) = self.client.disconnect() {
                debug!(error = %err, "abandoning connect at shutdown");
            }
            pending.reply.resolve(LifecycleOutcome::Cancelled);
        }
        while let Some(request) = self.shared.commands.try_pop() {
            request.into_reply().resolve(LifecycleOutcome::Cancelled);
        }

        self.shutdown_client();
        self.shutdown_server();
        self.client_phase = EndpointPhase::Stopped;
        self.server_phase = EndpointPhase::Stopped;
        self.reset_session();

        let client = self.shared.client_queue.clear();
        let server = self.shared.server_queue.clear();
        info!(
            dropped_client = client,
            dropped_server = server,
            "network endpoints torn down"
        );
    }
}
