//! Helpers shared by the driver integration tests.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use net_driver::{
    transport::TransportResult, ClientEndpoint, ClientEvent, Completion, ConnectPolicy,
    DeliveryMode, DisconnectReason, DriverConfig, InboundEvents, LifecycleOutcome,
    NetworkDriver, PeerId, ServerEndpoint, ServerEvent,
};

pub const PORT: u16 = 7777;
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Fast-failing configuration for tests.
pub fn config() -> DriverConfig {
    DriverConfig {
        connect_attempts: 3,
        connect_timeout_ms: 50,
        tick_ms: 1,
        ..DriverConfig::default()
    }
}

pub fn driver() -> (NetworkDriver, InboundEvents) {
    NetworkDriver::new(config()).expect("valid test config")
}

/// Waits for a lifecycle request, failing the test instead of hanging.
pub fn settle(mut completion: Completion) -> LifecycleOutcome {
    completion
        .wait_timeout(TIMEOUT)
        .expect("lifecycle request did not finish in time")
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

pub fn loopback() -> String {
    format!("127.0.0.1:{PORT}")
}

/// Client endpoint that records every send and, unless silent, reports a
/// successful connect as peer 1 once `delay` polls have passed after `connect`.
#[derive(Debug, Clone)]
pub struct RecordingClient {
    sent: Arc<Mutex<Vec<(Bytes, DeliveryMode)>>>,
    countdown: Option<u32>,
    delay: u32,
    silent: bool,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self {
            sent: Arc::default(),
            countdown: None,
            delay: 0,
            silent: false,
        }
    }

    /// Confirms the connect only on the poll after `polls` empty ones.
    pub fn delayed(polls: u32) -> Self {
        Self {
            delay: polls,
            ..Self::new()
        }
    }

    /// Accepts `connect` but never completes it.
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::new()
        }
    }

    pub fn sent(&self) -> Vec<(Bytes, DeliveryMode)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ClientEndpoint for RecordingClient {
    fn connect(&mut self, _addr: SocketAddr, _policy: ConnectPolicy) -> TransportResult<()> {
        self.countdown = Some(self.delay);
        Ok(())
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        self.countdown = None;
        Ok(())
    }

    fn send(&mut self, payload: Bytes, mode: DeliveryMode) -> TransportResult<()> {
        self.sent.lock().unwrap().push((payload, mode));
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<ClientEvent>) -> TransportResult<()> {
        if self.silent {
            return Ok(());
        }
        match self.countdown {
            Some(0) => {
                self.countdown = None;
                events.push(ClientEvent::Connected {
                    peer: PeerId::new(1),
                });
            }
            Some(left) => self.countdown = Some(left - 1),
            None => {}
        }
        Ok(())
    }
}

/// Server endpoint that accepts everything and reports nothing.
#[derive(Debug, Default)]
pub struct NullServer;

impl ServerEndpoint for NullServer {
    fn start(&mut self, _port: u16, _max_peers: u16) -> TransportResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn send_to(&mut self, _peer: PeerId, _payload: Bytes, _mode: DeliveryMode) -> TransportResult<()> {
        Ok(())
    }

    fn send_to_all(&mut self, _payload: Bytes, _mode: DeliveryMode) -> TransportResult<()> {
        Ok(())
    }

    fn poll(&mut self, _events: &mut Vec<ServerEvent>) -> TransportResult<()> {
        Ok(())
    }
}

/// Server endpoint that accepts a fixed set of peers as soon as it starts,
/// reporting them on the first poll after `start`.
#[derive(Debug, Default)]
pub struct AcceptingServer {
    peers: Vec<PeerId>,
    events: Vec<ServerEvent>,
}

impl AcceptingServer {
    pub fn new(peers: impl IntoIterator<Item = u16>) -> Self {
        Self {
            peers: peers.into_iter().map(PeerId::new).collect(),
            events: Vec::new(),
        }
    }
}

impl ServerEndpoint for AcceptingServer {
    fn start(&mut self, _port: u16, _max_peers: u16) -> TransportResult<()> {
        self.events.extend(
            self.peers
                .iter()
                .map(|&peer| ServerEvent::PeerConnected { peer }),
        );
        Ok(())
    }

    fn stop(&mut self) -> TransportResult<()> {
        self.events.extend(self.peers.iter().map(|&peer| {
            ServerEvent::PeerDisconnected {
                peer,
                reason: DisconnectReason::ServerStopped,
            }
        }));
        Ok(())
    }

    fn send_to(&mut self, _peer: PeerId, _payload: Bytes, _mode: DeliveryMode) -> TransportResult<()> {
        Ok(())
    }

    fn send_to_all(&mut self, _payload: Bytes, _mode: DeliveryMode) -> TransportResult<()> {
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<ServerEvent>) -> TransportResult<()> {
        events.append(&mut self.events);
        Ok(())
    }
}
