// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker event loop.
//!
//! A single thread multiplexes the TCP listener, the UDP publisher socket and
//! every subscriber connection with `mio::Poll`. No state is shared across
//! threads; the only cross-thread entry point is [`ShutdownHandle`].
//!
//! # Architecture
//!
//! ```text
//! +-----------------------------------------------------------+
//! |                         Broker                            |
//! |  +-----------------------------------------------------+  |
//! |  |                    mio::Poll                        |  |
//! |  |  - Waker        (shutdown requests)                 |  |
//! |  |  - TcpListener  (new subscribers)                   |  |
//! |  |  - UdpSocket    (publisher datagrams)               |  |
//! |  |  - TcpStreams   (identity, commands, outbound)      |  |
//! |  +-----------------------------------------------------+  |
//! |        |                 |                    |           |
//! |        v                 v                    v           |
//! |  +-----------+    +-------------+    +-----------------+  |
//! |  | handshake |    |   Router    |    | command parser  |  |
//! |  +-----------+    +-------------+    +-----------------+  |
//! |        \                 |                    /           |
//! |         +------> SubscriberRegistry <--------+            |
//! +-----------------------------------------------------------+
//! ```

mod handshake;
mod link;

pub use handshake::{parse_identity, HandshakeProgress, PendingLink};
pub use link::Link;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::READ_CHUNK_SIZE;
use crate::command::{Command, CommandError};
use crate::config::{BrokerConfig, ConfigError};
use crate::registry::{PacketSink, Subscriber, SubscriberRegistry};
use crate::router::{RouteStats, Router};
use crate::wire::decode_datagram;

// ============================================================================
// Constants
// ============================================================================

/// Token for the TCP listener
const LISTENER_TOKEN: Token = Token(0);

/// Token for the UDP publisher socket
const UDP_TOKEN: Token = Token(1);

/// Token for the shutdown waker
const WAKER_TOKEN: Token = Token(2);

/// Starting token for subscriber connections
const CONNECTION_TOKEN_START: usize = 3;

/// Maximum events to process per poll
const MAX_EVENTS: usize = 256;

/// Poll timeout while connections are still handshaking
const HANDSHAKE_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Errors and shutdown
// ============================================================================

/// Fatal broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stops a running broker from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Request shutdown. The loop exits after its current iteration.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake broker: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Connection-level counters (routing has its own, see [`RouteStats`]).
#[derive(Debug, Default, Clone)]
pub struct BrokerStats {
    pub connections_accepted: u64,
    pub handshakes_rejected: u64,
    pub handshakes_expired: u64,
    pub duplicate_identities: u64,
    pub datagrams_received: u64,
    pub datagrams_rejected: u64,
    pub buffer_overflows: u64,
    /// Live subscribers closed after a failed send (slow or broken peers).
    pub links_failed: u64,
}

// ============================================================================
// Broker
// ============================================================================

/// Per-token connection state.
#[derive(Debug)]
enum Connection {
    AwaitingIdentity(PendingLink),
    /// The link itself lives in the registry under this identity.
    Active(String),
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
    closed: bool,
}

impl Readiness {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_error(),
        }
    }

    fn wants_read(self) -> bool {
        self.readable || self.closed
    }
}

enum ReadOutcome {
    Drained,
    Closed,
    Overflow,
    Failed(io::Error),
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

/// Parse and apply every complete command line buffered for `subscriber`.
fn apply_commands(subscriber: &mut Subscriber<Link>) {
    while let Some(line) = subscriber.inbound_mut().take_line() {
        match Command::parse_bytes(&line) {
            Ok(command) => {
                debug!("{}: {:?}", subscriber.identity(), command);
                subscriber.apply(command);
            }
            Err(CommandError::Empty) => {}
            Err(e) => debug!("ignoring command from {}: {}", subscriber.identity(), e),
        }
    }
}

/// Read everything the socket has, feeding complete lines to the parser.
fn drain_link(subscriber: &mut Subscriber<Link>, chunk: &mut [u8]) -> ReadOutcome {
    loop {
        let result = match subscriber.link_mut() {
            Some(link) => link.read(chunk),
            None => return ReadOutcome::Closed,
        };
        match result {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => {
                if subscriber.inbound_mut().write(&chunk[..n]).is_err() {
                    return ReadOutcome::Overflow;
                }
                apply_commands(subscriber);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Drained,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
}

/// The broker: sockets, subscriber state and the event loop driving them.
pub struct Broker {
    config: BrokerConfig,
    poll: Poll,
    listener: TcpListener,
    udp: UdpSocket,
    registry: SubscriberRegistry<Link>,
    router: Router,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    read_buf: Vec<u8>,
    stats: BrokerStats,
}

impl Broker {
    /// Bind the TCP listener and the UDP socket on the configured port.
    ///
    /// With port 0 the UDP socket follows whatever port TCP was given.
    pub fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;

        let poll = Poll::new().map_err(BrokerError::Poll)?;

        let addr = config.listen_addr();
        let mut listener = bind_listener(addr, config.listen_backlog)
            .map_err(|source| BrokerError::Bind { addr, source })?;
        let udp_addr = SocketAddr::new(config.bind_address, listener.local_addr()?.port());
        let mut udp = bind_udp(udp_addr).map_err(|source| BrokerError::Bind {
            addr: udp_addr,
            source,
        })?;

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut udp, UDP_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let registry = SubscriberRegistry::with_limits(
            config.command_buffer_capacity,
            config.max_stored_messages,
        );
        let router = Router::new(config.delivery_policy);

        Ok(Self {
            config,
            poll,
            listener,
            udp,
            registry,
            router,
            connections: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            running: Arc::new(AtomicBool::new(true)),
            waker,
            read_buf: vec![0u8; READ_CHUNK_SIZE],
            stats: BrokerStats::default(),
        })
    }

    /// Address of the TCP listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address of the UDP socket.
    pub fn udp_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry<Link> {
        &self.registry
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    pub fn route_stats(&self) -> &RouteStats {
        self.router.stats()
    }

    /// Run until shutdown is requested.
    pub fn run(&mut self) -> Result<(), BrokerError> {
        info!("Server started on port {}", self.listener.local_addr()?.port());

        let mut events = Events::with_capacity(MAX_EVENTS);
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, self.poll_timeout()) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BrokerError::Poll(e));
            }

            let mut woken = false;
            let mut accept = false;
            let mut datagrams = false;
            let mut ready = Vec::new();
            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => woken = true,
                    LISTENER_TOKEN => accept = true,
                    UDP_TOKEN => datagrams = true,
                    token => ready.push((token, Readiness::from_event(event))),
                }
            }
            ready.sort_by_key(|(token, _)| *token);

            if woken {
                trace!("woken, running={}", self.running.load(Ordering::Acquire));
            }
            if accept {
                self.accept_connections();
            }
            if datagrams {
                self.receive_datagrams();
            }
            for (token, readiness) in ready {
                self.service_connection(token, readiness);
            }
            self.expire_handshakes(Instant::now());
        }

        self.close_all();
        let routed = self.router.stats();
        info!(
            "Broker stopped: {} datagrams ({} rejected), {} delivered, {} stored, {} dropped",
            self.stats.datagrams_received,
            self.stats.datagrams_rejected,
            routed.packets_delivered,
            routed.packets_stored,
            routed.packets_dropped
        );
        Ok(())
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let handshaking = self
            .connections
            .values()
            .any(|c| matches!(c, Connection::AwaitingIdentity(_)));
        match self.config.handshake_timeout() {
            Some(_) if handshaking => Some(HANDSHAKE_SWEEP_INTERVAL),
            _ => None,
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!("failed to register connection from {}: {}", peer, e);
                        continue;
                    }
                    if self.config.tcp_nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("TCP_NODELAY on {}: {}", peer, e);
                        }
                    }

                    debug!("accepted connection from {}", peer);
                    self.stats.connections_accepted += 1;
                    self.connections.insert(
                        token,
                        Connection::AwaitingIdentity(PendingLink::new(stream, peer)),
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn receive_datagrams(&mut self) {
        loop {
            match self.udp.recv_from(&mut self.read_buf) {
                Ok((len, sender)) => {
                    self.stats.datagrams_received += 1;
                    match decode_datagram(&self.read_buf[..len], sender) {
                        Ok(message) => {
                            let routed = self.router.distribute(&mut self.registry, &message);
                            match routed {
                                Ok(outcome) if outcome.send_failures > 0 => {
                                    self.reap_failed_links()
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("cannot forward {} from {}: {}", message.topic, sender, e);
                                }
                            }
                        }
                        Err(e) => {
                            self.stats.datagrams_rejected += 1;
                            debug!("dropping datagram from {}: {}", sender, e);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    break;
                }
            }
        }
    }

    fn service_connection(&mut self, token: Token, readiness: Readiness) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };

        match connection {
            Connection::AwaitingIdentity(pending) => {
                if !readiness.wants_read() {
                    return;
                }
                match pending.read_identity(&mut self.read_buf) {
                    HandshakeProgress::Incomplete => {}
                    HandshakeProgress::Closed => {
                        self.drop_pending(token, "closed before identifying");
                    }
                    HandshakeProgress::Rejected(e) => {
                        self.stats.handshakes_rejected += 1;
                        warn!("rejecting connection: {}", e);
                        self.drop_pending(token, "invalid identity");
                    }
                    HandshakeProgress::Identified { identity, leftover } => {
                        self.admit(token, identity, leftover);
                    }
                }
            }
            Connection::Active(identity) => {
                let identity = identity.clone();
                if readiness.writable && !self.flush_link(&identity) {
                    self.close_failed(token, &identity);
                    return;
                }
                if readiness.wants_read() {
                    self.read_commands(token, &identity);
                }
            }
        }
    }

    /// Promote an identified connection to an active subscriber.
    fn admit(&mut self, token: Token, identity: String, leftover: Vec<u8>) {
        let Some(Connection::AwaitingIdentity(pending)) = self.connections.remove(&token) else {
            return;
        };
        let (mut stream, peer) = pending.into_parts();

        if self.registry.is_connected(&identity) {
            info!("Client {} already connected.", identity);
            self.stats.duplicate_identities += 1;
            let _ = self.poll.registry().deregister(&mut stream);
            return;
        }

        let reconnecting = self.registry.contains(&identity);
        self.registry.get_or_create(&identity);
        let link = Link::new(stream, peer, self.config.max_pending_output_bytes);
        if let Err(e) = self.registry.mark_connected(&identity, link) {
            error!("cannot attach {}: {}", identity, e);
            return;
        }
        self.connections
            .insert(token, Connection::Active(identity.clone()));
        info!("New client {} connected from {}.", identity, peer);

        if reconnecting && !self.replay_stored(&identity) {
            self.close_failed(token, &identity);
            return;
        }

        if !leftover.is_empty() {
            let overflow = match self.registry.get_mut(&identity) {
                Some(subscriber) => {
                    let overflow = subscriber.inbound_mut().write(&leftover).is_err();
                    if !overflow {
                        apply_commands(subscriber);
                    }
                    overflow
                }
                None => false,
            };
            if overflow {
                self.stats.buffer_overflows += 1;
                error!("Client {} command buffer overflow. Disconnecting.", identity);
                self.disconnect(token, &identity);
                return;
            }
        }

        // Edge-triggered: drain whatever arrived behind the identity
        self.read_commands(token, &identity);
    }

    /// Send queued store-and-forward packets, oldest first.
    ///
    /// The queue is emptied up front; a send failure stops the replay and
    /// the remaining packets are not re-queued. Returns `false` if the link
    /// failed and must be closed.
    fn replay_stored(&mut self, identity: &str) -> bool {
        let Some(subscriber) = self.registry.get_mut(identity) else {
            return true;
        };
        let queued = subscriber.drain_pending();
        if queued.is_empty() {
            return true;
        }
        let Some(link) = subscriber.link_mut() else {
            return true;
        };

        let mut sent = 0;
        for packet in &queued {
            if let Err(e) = link.send_packet(packet) {
                warn!(
                    "replay to {} stopped after {} of {}: {}",
                    identity,
                    sent,
                    queued.len(),
                    e
                );
                return false;
            }
            sent += 1;
        }
        debug!("replayed {} stored packets to {}", sent, identity);
        true
    }

    /// Push queued output on a writable event. Returns `false` on a hard error.
    fn flush_link(&mut self, identity: &str) -> bool {
        let link = self
            .registry
            .get_mut(identity)
            .and_then(|subscriber| subscriber.link_mut());
        match link.map(|link| link.flush_pending()) {
            Some(Err(e)) => {
                debug!("flush to {} failed: {}", identity, e);
                false
            }
            _ => true,
        }
    }

    /// Close every active link whose last send failed.
    ///
    /// A stalled peer never produces the read event that would otherwise
    /// reap it, so this runs right after any fan-out that saw a failure.
    fn reap_failed_links(&mut self) {
        let failed: Vec<(Token, String)> = self
            .connections
            .iter()
            .filter_map(|(token, connection)| match connection {
                Connection::Active(identity) => {
                    let link = self.registry.get(identity).and_then(|s| s.link())?;
                    link.is_failed().then(|| (*token, identity.clone()))
                }
                Connection::AwaitingIdentity(_) => None,
            })
            .collect();
        for (token, identity) in failed {
            self.close_failed(token, &identity);
        }
    }

    fn close_failed(&mut self, token: Token, identity: &str) {
        self.stats.links_failed += 1;
        debug!("closing {} after a failed send", identity);
        info!("Client {} disconnected.", identity);
        self.disconnect(token, identity);
    }

    fn read_commands(&mut self, token: Token, identity: &str) {
        let outcome = match self.registry.get_mut(identity) {
            Some(subscriber) => drain_link(subscriber, &mut self.read_buf),
            None => ReadOutcome::Closed,
        };

        match outcome {
            ReadOutcome::Drained => {}
            ReadOutcome::Closed => {
                info!("Client {} disconnected.", identity);
                self.disconnect(token, identity);
            }
            ReadOutcome::Overflow => {
                self.stats.buffer_overflows += 1;
                error!("Client {} command buffer overflow. Disconnecting.", identity);
                self.disconnect(token, identity);
            }
            ReadOutcome::Failed(e) => {
                debug!("read from {} failed: {}", identity, e);
                info!("Client {} disconnected.", identity);
                self.disconnect(token, identity);
            }
        }
    }

    fn disconnect(&mut self, token: Token, identity: &str) {
        self.connections.remove(&token);
        if let Some(mut link) = self.registry.mark_disconnected(identity) {
            let _ = self.poll.registry().deregister(link.stream_mut());
        }
    }

    fn drop_pending(&mut self, token: Token, reason: &str) {
        if let Some(Connection::AwaitingIdentity(mut pending)) = self.connections.remove(&token) {
            debug!("closing connection from {}: {}", pending.peer(), reason);
            let _ = self.poll.registry().deregister(pending.stream_mut());
        }
    }

    fn expire_handshakes(&mut self, now: Instant) {
        let Some(timeout) = self.config.handshake_timeout() else {
            return;
        };
        let expired: Vec<Token> = self
            .connections
            .iter()
            .filter_map(|(token, connection)| match connection {
                Connection::AwaitingIdentity(p) if p.is_expired(timeout, now) => Some(*token),
                _ => None,
            })
            .collect();
        for token in expired {
            self.stats.handshakes_expired += 1;
            self.drop_pending(token, "handshake timed out");
        }
    }

    fn close_all(&mut self) {
        for (_, connection) in self.connections.drain() {
            if let Connection::AwaitingIdentity(mut pending) = connection {
                let _ = self.poll.registry().deregister(pending.stream_mut());
            }
        }
        for (identity, mut link) in self.registry.disconnect_all() {
            debug!("closing connection of {}", identity);
            let _ = self.poll.registry().deregister(link.stream_mut());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;

    fn local_config() -> BrokerConfig {
        BrokerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            admin_stdin: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_constants() {
        assert_eq!(LISTENER_TOKEN, Token(0));
        assert_eq!(UDP_TOKEN, Token(1));
        assert_eq!(WAKER_TOKEN, Token(2));
        assert_eq!(CONNECTION_TOKEN_START, 3);
        assert_eq!(MAX_EVENTS, 256);
    }

    #[test]
    fn test_bind_ephemeral_shares_port() {
        let broker = Broker::bind(local_config()).unwrap();
        let tcp = broker.local_addr().unwrap();
        let udp = broker.udp_addr().unwrap();
        assert_ne!(tcp.port(), 0);
        assert_eq!(tcp.port(), udp.port());
        assert!(broker.registry().is_empty());
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let config = BrokerConfig {
            listen_backlog: 0,
            ..local_config()
        };
        assert!(matches!(
            Broker::bind(config),
            Err(BrokerError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_shutdown_handle_stops_run() {
        let mut broker = Broker::bind(local_config()).unwrap();
        let handle = broker.shutdown_handle();
        assert!(handle.is_running());

        let worker = thread::spawn(move || broker.run());
        thread::sleep(Duration::from_millis(50));
        handle.shutdown();
        assert!(worker.join().unwrap().is_ok());
        assert!(!handle.is_running());
    }

    #[test]
    fn test_apply_commands_skips_garbage() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut registry = SubscriberRegistry::new();
        registry.get_or_create("C1");
        let link = Link::new(mio::net::TcpStream::from_std(server), peer, 1 << 20);
        registry.mark_connected("C1", link).unwrap();

        let subscriber = registry.get_mut("C1").unwrap();
        subscriber
            .inbound_mut()
            .write(b"subscribe a 1\nbogus\n\nsubscribe b 0 x\nsubscribe c 0\npartial")
            .unwrap();
        apply_commands(subscriber);

        let patterns: Vec<_> = subscriber.subscriptions().collect();
        assert_eq!(patterns, vec![("a", true), ("c", false)]);
        assert_eq!(subscriber.inbound_mut().len(), "partial".len());
    }
}
