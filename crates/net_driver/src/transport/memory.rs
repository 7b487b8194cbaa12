//! In-process transport.
//!
//! A [`MemoryNetwork`] is a switchboard that client and server endpoints
//! plug into. Servers claim a port when they start; clients connect by port
//! (the host part of the address is ignored) and are handed the lowest free
//! peer id. Nothing touches a socket, which makes this the transport for
//! singleplayer hosting and for tests.
//!
//! A network built with [`MemoryNetwork::with_traffic_log`] also appends every
//! payload that crosses it to a traffic log, so callers can check ordering and
//! delivery modes after the fact. The default network keeps no log.
//!
//! Connect attempts are paced by [`ConnectPolicy::attempt_timeout`]: the first
//! attempt runs on the first poll after `connect`, each retry on the first poll
//! once the previous attempt's timeout has passed.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use bytes::Bytes;
use tracing::{debug, trace};

use super::{
    ClientEndpoint, ClientEvent, ConnectPolicy, ServerEndpoint, ServerEvent, TransportResult,
};
use crate::{error::DisconnectReason, ids::PeerId, messages::DeliveryMode, TransportError};

type EndpointKey = u64;

/// Which way a logged frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

/// One payload as it crossed the switchboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    /// Sending peer for [`Direction::ToServer`], receiving peer otherwise.
    pub peer: PeerId,
    pub port: u16,
    pub mode: DeliveryMode,
    pub payload: Bytes,
}

#[derive(Debug)]
enum Link {
    Idle,
    Connecting {
        port: u16,
        policy: ConnectPolicy,
        attempts: u32,
        next_attempt: Instant,
    },
    Connected { port: u16, server: EndpointKey, peer: PeerId },
}

#[derive(Debug)]
struct ClientSlot {
    link: Link,
    events: VecDeque<ClientEvent>,
}

#[derive(Debug)]
struct Listening {
    port: u16,
    max_peers: u16,
    peers: BTreeMap<PeerId, EndpointKey>,
}

impl Listening {
    fn free_peer_id(&self) -> Option<PeerId> {
        (1..=u16::MAX)
            .map(PeerId::new)
            .find(|id| !self.peers.contains_key(id))
    }
}

#[derive(Debug, Default)]
struct ServerSlot {
    listening: Option<Listening>,
    events: VecDeque<ServerEvent>,
}

#[derive(Debug, Default)]
struct Switchboard {
    next_key: EndpointKey,
    clients: HashMap<EndpointKey, ClientSlot>,
    servers: HashMap<EndpointKey, ServerSlot>,
    listeners: HashMap<u16, EndpointKey>,
    traffic: Option<Vec<Frame>>,
    fail_sends: bool,
}

impl Switchboard {
    fn allocate_key(&mut self) -> EndpointKey {
        self.next_key += 1;
        self.next_key
    }

    fn push_client_event(&mut self, client: EndpointKey, event: ClientEvent) {
        if let Some(slot) = self.clients.get_mut(&client) {
            slot.events.push_back(event);
        }
    }

    fn push_server_event(&mut self, server: EndpointKey, event: ServerEvent) {
        if let Some(slot) = self.servers.get_mut(&server) {
            slot.events.push_back(event);
        }
    }

    fn record(&mut self, frame: Frame) {
        if let Some(log) = self.traffic.as_mut() {
            log.push(frame);
        }
    }

    /// One connect attempt for a client in [`Link::Connecting`], if one is due.
    fn attempt_connect(&mut self, client: EndpointKey) {
        let now = Instant::now();
        let Some(ClientSlot {
            link:
                Link::Connecting {
                    port,
                    policy,
                    attempts,
                    next_attempt,
                },
            ..
        }) = self.clients.get(&client)
        else {
            return;
        };
        if now < *next_attempt {
            return;
        }
        let (port, policy, attempts) = (*port, *policy, *attempts + 1);

        let outcome = match self.listeners.get(&port).copied() {
            None => Err(DisconnectReason::Refused),
            Some(server) => {
                let listening = self
                    .servers
                    .get_mut(&server)
                    .and_then(|slot| slot.listening.as_mut());
                match listening {
                    None => Err(DisconnectReason::Refused),
                    Some(listening) if listening.peers.len() >= listening.max_peers as usize => {
                        Err(DisconnectReason::ServerFull)
                    }
                    Some(listening) => match listening.free_peer_id() {
                        Some(peer) => {
                            listening.peers.insert(peer, client);
                            Ok((server, peer))
                        }
                        None => Err(DisconnectReason::ServerFull),
                    },
                }
            }
        };

        let Some(slot) = self.clients.get_mut(&client) else {
            return;
        };
        match outcome {
            Ok((server, peer)) => {
                slot.link = Link::Connected { port, server, peer };
                slot.events.push_back(ClientEvent::Connected { peer });
                self.push_server_event(server, ServerEvent::PeerConnected { peer });
                debug!(port, peer = %peer, "memory client connected");
            }
            Err(reason) if attempts >= policy.max_attempts => {
                slot.link = Link::Idle;
                slot.events.push_back(ClientEvent::ConnectFailed { reason });
                debug!(port, attempts, ?reason, "memory client gave up connecting");
            }
            Err(reason) => {
                slot.link = Link::Connecting {
                    port,
                    policy,
                    attempts,
                    next_attempt: now + policy.attempt_timeout,
                };
                trace!(port, attempts, ?reason, "memory connect attempt failed");
            }
        }
    }

    /// Drops the client's connection, notifying the server it was attached to.
    fn detach_client(&mut self, client: EndpointKey, reason: DisconnectReason) -> bool {
        let Some(slot) = self.clients.get_mut(&client) else {
            return false;
        };
        match std::mem::replace(&mut slot.link, Link::Idle) {
            Link::Idle => false,
            Link::Connecting { .. } => true,
            Link::Connected { server, peer, .. } => {
                if let Some(listening) = self
                    .servers
                    .get_mut(&server)
                    .and_then(|slot| slot.listening.as_mut())
                {
                    listening.peers.remove(&peer);
                }
                self.push_server_event(server, ServerEvent::PeerDisconnected { peer, reason });
                true
            }
        }
    }

    /// Stops listening and disconnects every peer of `server`.
    fn shutdown_server(&mut self, server: EndpointKey) -> bool {
        let Some(listening) = self
            .servers
            .get_mut(&server)
            .and_then(|slot| slot.listening.take())
        else {
            return false;
        };
        self.listeners.remove(&listening.port);
        for client in listening.peers.into_values() {
            if let Some(slot) = self.clients.get_mut(&client) {
                slot.link = Link::Idle;
                slot.events.push_back(ClientEvent::Disconnected {
                    reason: DisconnectReason::ServerStopped,
                });
            }
        }
        debug!(port = listening.port, "memory server stopped");
        true
    }

    fn check_send(&self) -> TransportResult<()> {
        if self.fail_sends {
            Err(TransportError::Other("send failure injected".into()))
        } else {
            Ok(())
        }
    }
}

/// Shared in-process switchboard. Cheap to clone; clones see the same endpoints.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a network that records every frame; see [`traffic`](Self::traffic).
    pub fn with_traffic_log() -> Self {
        let network = Self::default();
        network.lock().traffic = Some(Vec::new());
        network
    }

    fn lock(&self) -> MutexGuard<'_, Switchboard> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a client endpoint plugged into this network.
    pub fn client(&self) -> MemoryClient {
        let mut board = self.lock();
        let key = board.allocate_key();
        board.clients.insert(
            key,
            ClientSlot {
                link: Link::Idle,
                events: VecDeque::new(),
            },
        );
        MemoryClient {
            network: self.clone(),
            key,
        }
    }

    /// Creates a server endpoint plugged into this network.
    pub fn server(&self) -> MemoryServer {
        let mut board = self.lock();
        let key = board.allocate_key();
        board.servers.insert(key, ServerSlot::default());
        MemoryServer {
            network: self.clone(),
            key,
        }
    }

    /// Every frame that crossed the network so far, in send order.
    ///
    /// Always empty unless the network was built with
    /// [`with_traffic_log`](Self::with_traffic_log).
    pub fn traffic(&self) -> Vec<Frame> {
        self.lock().traffic.clone().unwrap_or_default()
    }

    /// Returns the logged frames and empties the log.
    pub fn take_traffic(&self) -> Vec<Frame> {
        self.lock()
            .traffic
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Makes every subsequent send on any endpoint fail until switched off.
    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Whether a server currently listens on `port`.
    pub fn is_listening(&self, port: u16) -> bool {
        self.lock().listeners.contains_key(&port)
    }

    /// Peers currently attached to the server listening on `port`.
    pub fn peers_on(&self, port: u16) -> Vec<PeerId> {
        let board = self.lock();
        board
            .listeners
            .get(&port)
            .and_then(|server| board.servers.get(server))
            .and_then(|slot| slot.listening.as_ref())
            .map(|listening| listening.peers.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// Client half of the memory transport.
#[derive(Debug)]
pub struct MemoryClient {
    network: MemoryNetwork,
    key: EndpointKey,
}

impl ClientEndpoint for MemoryClient {
    fn connect(&mut self, addr: SocketAddr, policy: ConnectPolicy) -> TransportResult<()> {
        let mut board = self.network.lock();
        let slot = board.clients.get_mut(&self.key).ok_or(TransportError::NotReady)?;
        if !matches!(slot.link, Link::Idle) {
            return Err(TransportError::AlreadyConnected);
        }
        slot.link = Link::Connecting {
            port: addr.port(),
            policy,
            attempts: 0,
            next_attempt: Instant::now(),
        };
        debug!(%addr, "memory client connecting");
        Ok(())
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        let mut board = self.network.lock();
        if !board.detach_client(self.key, DisconnectReason::Graceful) {
            return Err(TransportError::NotConnected);
        }
        board.push_client_event(
            self.key,
            ClientEvent::Disconnected {
                reason: DisconnectReason::Graceful,
            },
        );
        Ok(())
    }

    fn send(&mut self, payload: Bytes, mode: DeliveryMode) -> TransportResult<()> {
        let mut board = self.network.lock();
        board.check_send()?;
        let (port, server, peer) = match board.clients.get(&self.key).map(|slot| &slot.link) {
            Some(Link::Connected { port, server, peer }) => (*port, *server, *peer),
            _ => return Err(TransportError::NotConnected),
        };
        board.record(Frame {
            direction: Direction::ToServer,
            peer,
            port,
            mode,
            payload: payload.clone(),
        });
        board.push_server_event(server, ServerEvent::Message { peer, payload });
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<ClientEvent>) -> TransportResult<()> {
        let mut board = self.network.lock();
        board.attempt_connect(self.key);
        let slot = board.clients.get_mut(&self.key).ok_or(TransportError::NotReady)?;
        events.extend(slot.events.drain(..));
        Ok(())
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        let mut board = self.network.lock();
        board.detach_client(self.key, DisconnectReason::Graceful);
        board.clients.remove(&self.key);
    }
}

/// Server half of the memory transport.
#[derive(Debug)]
pub struct MemoryServer {
    network: MemoryNetwork,
    key: EndpointKey,
}

impl MemoryServer {
    /// Address clients would use to reach this server on `port`.
    pub fn loopback_addr(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    /// Removes `peer` from the server as if the connection timed out.
    pub fn kick(&mut self, peer: PeerId) -> TransportResult<()> {
        let mut board = self.network.lock();
        let client = board
            .servers
            .get(&self.key)
            .and_then(|slot| slot.listening.as_ref())
            .and_then(|listening| listening.peers.get(&peer).copied())
            .ok_or(TransportError::UnknownPeer(peer))?;
        board.detach_client(client, DisconnectReason::TimedOut);
        board.push_client_event(
            client,
            ClientEvent::Disconnected {
                reason: DisconnectReason::TimedOut,
            },
        );
        Ok(())
    }
}

impl ServerEndpoint for MemoryServer {
    fn start(&mut self, port: u16, max_peers: u16) -> TransportResult<()> {
        let mut board = self.network.lock();
        if board.listeners.contains_key(&port) {
            return Err(TransportError::AddrInUse(Self::loopback_addr(port)));
        }
        let slot = board.servers.get_mut(&self.key).ok_or(TransportError::NotReady)?;
        if slot.listening.is_some() {
            return Err(TransportError::AlreadyListening);
        }
        slot.listening = Some(Listening {
            port,
            max_peers,
            peers: BTreeMap::new(),
        });
        board.listeners.insert(port, self.key);
        debug!(port, max_peers, "memory server listening");
        Ok(())
    }

    fn stop(&mut self) -> TransportResult<()> {
        let mut board = self.network.lock();
        if board.shutdown_server(self.key) {
            Ok(())
        } else {
            Err(TransportError::NotReady)
        }
    }

    fn send_to(&mut self, peer: PeerId, payload: Bytes, mode: DeliveryMode) -> TransportResult<()> {
        let mut board = self.network.lock();
        board.check_send()?;
        let listening = board
            .servers
            .get(&self.key)
            .and_then(|slot| slot.listening.as_ref())
            .ok_or(TransportError::NotReady)?;
        let port = listening.port;
        let client = listening
            .peers
            .get(&peer)
            .copied()
            .ok_or(TransportError::UnknownPeer(peer))?;
        board.record(Frame {
            direction: Direction::ToClient,
            peer,
            port,
            mode,
            payload: payload.clone(),
        });
        board.push_client_event(client, ClientEvent::Message { payload });
        Ok(())
    }

    fn send_to_all(&mut self, payload: Bytes, mode: DeliveryMode) -> TransportResult<()> {
        let mut board = self.network.lock();
        board.check_send()?;
        let listening = board
            .servers
            .get(&self.key)
            .and_then(|slot| slot.listening.as_ref())
            .ok_or(TransportError::NotReady)?;
        let port = listening.port;
        let peers: Vec<(PeerId, EndpointKey)> =
            listening.peers.iter().map(|(peer, client)| (*peer, *client)).collect();
        for (peer, client) in peers {
            board.record(Frame {
                direction: Direction::ToClient,
                peer,
                port,
                mode,
                payload: payload.clone(),
            });
            board.push_client_event(
                client,
                ClientEvent::Message {
                    payload: payload.clone(),
                },
            );
        }
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<ServerEvent>) -> TransportResult<()> {
        let mut board = self.network.lock();
        let slot = board.servers.get_mut(&self.key).ok_or(TransportError::NotReady)?;
        events.extend(slot.events.drain(..));
        Ok(())
    }
}

impl Drop for MemoryServer {
    fn drop(&mut self) {
        let mut board = self.network.lock();
        board.shutdown_server(self.key);
        board.servers.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const PORT: u16 = 7777;

    fn policy(max_attempts: u32) -> ConnectPolicy {
        ConnectPolicy {
            max_attempts,
            attempt_timeout: Duration::ZERO,
        }
    }

    fn poll_client(client: &mut MemoryClient) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        client.poll(&mut events).unwrap();
        events
    }

    fn poll_server(server: &mut MemoryServer) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        server.poll(&mut events).unwrap();
        events
    }

    fn connected() -> (MemoryNetwork, MemoryServer, MemoryClient) {
        let network = MemoryNetwork::with_traffic_log();
        let mut server = network.server();
        let mut client = network.client();
        server.start(PORT, 4).unwrap();
        client
            .connect(MemoryServer::loopback_addr(PORT), policy(1))
            .unwrap();
        poll_client(&mut client);
        poll_server(&mut server);
        (network, server, client)
    }

    #[test]
    fn test_connect_assigns_first_peer_id() {
        let network = MemoryNetwork::new();
        let mut server = network.server();
        let mut client = network.client();
        server.start(PORT, 4).unwrap();
        client
            .connect(MemoryServer::loopback_addr(PORT), policy(1))
            .unwrap();

        assert_eq!(
            poll_client(&mut client),
            vec![ClientEvent::Connected { peer: PeerId::new(1) }]
        );
        assert_eq!(
            poll_server(&mut server),
            vec![ServerEvent::PeerConnected { peer: PeerId::new(1) }]
        );
        assert_eq!(network.peers_on(PORT), vec![PeerId::new(1)]);
    }

    #[test]
    fn test_connect_refused_after_all_attempts() {
        let network = MemoryNetwork::new();
        let mut client = network.client();
        client
            .connect(MemoryServer::loopback_addr(PORT), policy(3))
            .unwrap();

        assert!(poll_client(&mut client).is_empty());
        assert!(poll_client(&mut client).is_empty());
        assert_eq!(
            poll_client(&mut client),
            vec![ClientEvent::ConnectFailed {
                reason: DisconnectReason::Refused
            }]
        );
        // Idle again, so a new connect is accepted.
        client
            .connect(MemoryServer::loopback_addr(PORT), policy(1))
            .unwrap();
    }

    #[test]
    fn test_retries_wait_for_attempt_timeout() {
        let network = MemoryNetwork::new();
        let mut client = network.client();
        client
            .connect(
                MemoryServer::loopback_addr(PORT),
                ConnectPolicy {
                    max_attempts: 2,
                    attempt_timeout: Duration::from_millis(40),
                },
            )
            .unwrap();

        // First attempt is refused; polling again right away is not a retry.
        assert!(poll_client(&mut client).is_empty());
        for _ in 0..10 {
            assert!(poll_client(&mut client).is_empty());
        }

        let mut server = network.server();
        server.start(PORT, 4).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(
            poll_client(&mut client),
            vec![ClientEvent::Connected { peer: PeerId::new(1) }]
        );
    }

    #[test]
    fn test_full_server_refuses() {
        let network = MemoryNetwork::new();
        let mut server = network.server();
        server.start(PORT, 1).unwrap();
        let mut first = network.client();
        let mut second = network.client();
        first.connect(MemoryServer::loopback_addr(PORT), policy(1)).unwrap();
        second.connect(MemoryServer::loopback_addr(PORT), policy(1)).unwrap();

        assert!(matches!(
            poll_client(&mut first).as_slice(),
            [ClientEvent::Connected { .. }]
        ));
        assert_eq!(
            poll_client(&mut second),
            vec![ClientEvent::ConnectFailed {
                reason: DisconnectReason::ServerFull
            }]
        );
    }

    #[test]
    fn test_port_in_use() {
        let network = MemoryNetwork::new();
        let mut first = network.server();
        let mut second = network.server();
        first.start(PORT, 4).unwrap();
        assert!(matches!(
            second.start(PORT, 4),
            Err(TransportError::AddrInUse(_))
        ));
    }

    #[test]
    fn test_roundtrip_is_logged_with_modes() {
        let (network, mut server, mut client) = connected();
        let peer = PeerId::new(1);

        client
            .send(Bytes::from_static(b"hello"), DeliveryMode::Unreliable)
            .unwrap();
        assert_eq!(
            poll_server(&mut server),
            vec![ServerEvent::Message {
                peer,
                payload: Bytes::from_static(b"hello")
            }]
        );

        server
            .send_to(peer, Bytes::from_static(b"welcome"), DeliveryMode::Reliable)
            .unwrap();
        assert_eq!(
            poll_client(&mut client),
            vec![ClientEvent::Message {
                payload: Bytes::from_static(b"welcome")
            }]
        );

        let traffic = network.traffic();
        assert_eq!(traffic.len(), 2);
        assert_eq!(traffic[0].direction, Direction::ToServer);
        assert_eq!(traffic[0].mode, DeliveryMode::Unreliable);
        assert_eq!(traffic[1].direction, Direction::ToClient);
        assert_eq!(traffic[1].mode, DeliveryMode::Reliable);
    }

    #[test]
    fn test_broadcast_reaches_every_peer() {
        let (network, mut server, mut first) = connected();
        let mut second = network.client();
        second.connect(MemoryServer::loopback_addr(PORT), policy(1)).unwrap();
        poll_client(&mut second);
        poll_server(&mut server);

        server
            .send_to_all(Bytes::from_static(b"tick"), DeliveryMode::Unreliable)
            .unwrap();

        for client in [&mut first, &mut second] {
            assert_eq!(
                poll_client(client),
                vec![ClientEvent::Message {
                    payload: Bytes::from_static(b"tick")
                }]
            );
        }
    }

    #[test]
    fn test_default_network_keeps_no_traffic_log() {
        let network = MemoryNetwork::new();
        let mut server = network.server();
        let mut client = network.client();
        server.start(PORT, 4).unwrap();
        client
            .connect(MemoryServer::loopback_addr(PORT), policy(1))
            .unwrap();
        poll_client(&mut client);

        for _ in 0..100 {
            client
                .send(Bytes::from_static(b"tick"), DeliveryMode::Unreliable)
                .unwrap();
        }
        assert!(network.traffic().is_empty());
        assert_eq!(poll_server(&mut server).len(), 101);
    }

    #[test]
    fn test_take_traffic_drains_log() {
        let (network, _server, mut client) = connected();
        client.send(Bytes::new(), DeliveryMode::Reliable).unwrap();

        assert_eq!(network.take_traffic().len(), 1);
        assert!(network.traffic().is_empty());
        client.send(Bytes::new(), DeliveryMode::Reliable).unwrap();
        assert_eq!(network.traffic().len(), 1);
    }

    #[test]
    fn test_client_disconnect_notifies_server() {
        let (_network, mut server, mut client) = connected();
        client.disconnect().unwrap();

        assert_eq!(
            poll_server(&mut server),
            vec![ServerEvent::PeerDisconnected {
                peer: PeerId::new(1),
                reason: DisconnectReason::Graceful
            }]
        );
        assert!(matches!(
            client.send(Bytes::new(), DeliveryMode::Reliable),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(client.disconnect(), Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_server_stop_disconnects_peers() {
        let (network, mut server, mut client) = connected();
        server.stop().unwrap();

        assert!(!network.is_listening(PORT));
        assert_eq!(
            poll_client(&mut client),
            vec![ClientEvent::Disconnected {
                reason: DisconnectReason::ServerStopped
            }]
        );
        assert!(matches!(server.stop(), Err(TransportError::NotReady)));
    }

    #[test]
    fn test_kick_times_out_peer() {
        let (_network, mut server, mut client) = connected();
        server.kick(PeerId::new(1)).unwrap();

        assert_eq!(
            poll_client(&mut client),
            vec![ClientEvent::Disconnected {
                reason: DisconnectReason::TimedOut
            }]
        );
        assert_eq!(
            poll_server(&mut server),
            vec![ServerEvent::PeerDisconnected {
                peer: PeerId::new(1),
                reason: DisconnectReason::TimedOut
            }]
        );
    }

    #[test]
    fn test_injected_send_failure() {
        let (network, mut server, mut client) = connected();
        network.fail_sends(true);
        assert!(client.send(Bytes::new(), DeliveryMode::Reliable).is_err());
        assert!(server.send_to_all(Bytes::new(), DeliveryMode::Reliable).is_err());
        network.fail_sends(false);
        assert!(client.send(Bytes::new(), DeliveryMode::Reliable).is_ok());
    }

    #[test]
    fn test_dropping_server_frees_port() {
        let network = MemoryNetwork::new();
        {
            let mut server = network.server();
            server.start(PORT, 4).unwrap();
            assert!(network.is_listening(PORT));
        }
        assert!(!network.is_listening(PORT));
    }
}
