// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber registry.
//!
//! Subscribers are keyed by the identity they present on connect and outlive
//! their TCP connections: subscriptions and the store-and-forward queue
//! survive a disconnect and are picked up again on reconnect.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;

use bytes::Bytes;
use thiserror::Error;

use crate::buffer::{CommandBuffer, DEFAULT_COMMAND_BUFFER_CAPACITY};
use crate::command::Command;

/// Longest accepted subscriber identity, in bytes.
pub const MAX_IDENTITY_LEN: usize = 10;

/// Outbound half of a live subscriber connection.
pub trait PacketSink {
    /// Queue or write one complete forward packet.
    fn send_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// Invalid identity presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,

    #[error("identity of {0} bytes exceeds {max}", max = MAX_IDENTITY_LEN)]
    TooLong(usize),

    #[error("identity contains a control character")]
    InvalidCharacter,

    #[error("identity is not valid UTF-8")]
    NotUtf8,
}

/// Check raw identity bytes (without the NUL terminator).
pub fn validate_identity(raw: &[u8]) -> Result<String, IdentityError> {
    if raw.is_empty() {
        return Err(IdentityError::Empty);
    }
    if raw.len() > MAX_IDENTITY_LEN {
        return Err(IdentityError::TooLong(raw.len()));
    }
    if raw.iter().any(|b| matches!(b, b'\n' | b'\r' | 0)) {
        return Err(IdentityError::InvalidCharacter);
    }
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| IdentityError::NotUtf8)
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown subscriber {0}")]
    UnknownSubscriber(String),

    #[error("client {0} already connected")]
    AlreadyConnected(String),

    #[error("client {0} is connected; packets are sent, not stored")]
    Connected(String),

    #[error("store-and-forward queue of {identity} is full ({limit} packets)")]
    StoreFull { identity: String, limit: usize },
}

/// Network state of a subscriber.
#[derive(Debug)]
pub enum LinkState<S> {
    Disconnected,
    Active(S),
}

/// One subscriber identity and everything the broker keeps for it.
#[derive(Debug)]
pub struct Subscriber<S> {
    identity: String,
    link: LinkState<S>,
    /// Pattern -> store-and-forward flag, iterated in pattern order.
    subscriptions: BTreeMap<String, bool>,
    pending: VecDeque<Bytes>,
    inbound: CommandBuffer,
    /// 0 = unlimited.
    max_stored: usize,
}

impl<S> Subscriber<S> {
    fn new(identity: &str, buffer_capacity: usize, max_stored: usize) -> Self {
        Self {
            identity: identity.to_string(),
            link: LinkState::Disconnected,
            subscriptions: BTreeMap::new(),
            pending: VecDeque::new(),
            inbound: CommandBuffer::new(buffer_capacity),
            max_stored,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, LinkState::Active(_))
    }

    pub fn link(&self) -> Option<&S> {
        match &self.link {
            LinkState::Active(link) => Some(link),
            LinkState::Disconnected => None,
        }
    }

    pub fn link_mut(&mut self) -> Option<&mut S> {
        match &mut self.link {
            LinkState::Active(link) => Some(link),
            LinkState::Disconnected => None,
        }
    }

    /// Subscriptions as `(pattern, store_forward)` in pattern order.
    pub fn subscriptions(&self) -> impl Iterator<Item = (&str, bool)> {
        self.subscriptions.iter().map(|(p, sf)| (p.as_str(), *sf))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Add or replace a subscription.
    pub fn subscribe(&mut self, pattern: &str, store_forward: bool) {
        self.subscriptions.insert(pattern.to_string(), store_forward);
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&mut self, pattern: &str) -> bool {
        self.subscriptions.remove(pattern).is_some()
    }

    /// Apply a parsed command line.
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                topic,
                store_forward,
            } => self.subscribe(&topic, store_forward),
            Command::Unsubscribe { topic } => {
                self.unsubscribe(&topic);
            }
        }
    }

    pub fn inbound_mut(&mut self) -> &mut CommandBuffer {
        &mut self.inbound
    }

    /// Number of packets waiting for reconnect.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue a packet while disconnected.
    pub fn store(&mut self, packet: Bytes) -> Result<(), RegistryError> {
        if self.is_connected() {
            return Err(RegistryError::Connected(self.identity.clone()));
        }
        if self.max_stored != 0 && self.pending.len() >= self.max_stored {
            return Err(RegistryError::StoreFull {
                identity: self.identity.clone(),
                limit: self.max_stored,
            });
        }
        self.pending.push_back(packet);
        Ok(())
    }

    /// Take every queued packet, oldest first.
    pub fn drain_pending(&mut self) -> Vec<Bytes> {
        self.pending.drain(..).collect()
    }
}

/// All subscribers the broker has ever seen.
#[derive(Debug)]
pub struct SubscriberRegistry<S> {
    subscribers: HashMap<String, Subscriber<S>>,
    buffer_capacity: usize,
    max_stored: usize,
}

impl<S> Default for SubscriberRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SubscriberRegistry<S> {
    /// Registry with default buffer size and unbounded queues.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_COMMAND_BUFFER_CAPACITY, 0)
    }

    /// Registry with explicit per-subscriber limits (`max_stored` 0 = unbounded).
    pub fn with_limits(buffer_capacity: usize, max_stored: usize) -> Self {
        Self {
            subscribers: HashMap::new(),
            buffer_capacity,
            max_stored,
        }
    }

    /// Look up a subscriber, creating a disconnected one if absent.
    pub fn get_or_create(&mut self, identity: &str) -> &mut Subscriber<S> {
        let (capacity, max_stored) = (self.buffer_capacity, self.max_stored);
        self.subscribers
            .entry(identity.to_string())
            .or_insert_with(|| Subscriber::new(identity, capacity, max_stored))
    }

    pub fn get(&self, identity: &str) -> Option<&Subscriber<S>> {
        self.subscribers.get(identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut Subscriber<S>> {
        self.subscribers.get_mut(identity)
    }

    fn require(&mut self, identity: &str) -> Result<&mut Subscriber<S>, RegistryError> {
        self.subscribers
            .get_mut(identity)
            .ok_or_else(|| RegistryError::UnknownSubscriber(identity.to_string()))
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.subscribers.contains_key(identity)
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.get(identity).is_some_and(Subscriber::is_connected)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.subscribers.values().filter(|s| s.is_connected()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscriber<S>> {
        self.subscribers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subscriber<S>> {
        self.subscribers.values_mut()
    }

    /// Attach a live connection. Fails if one is already attached.
    ///
    /// The command buffer starts empty for every new connection.
    pub fn mark_connected(&mut self, identity: &str, link: S) -> Result<(), RegistryError> {
        let subscriber = self.require(identity)?;
        if subscriber.is_connected() {
            return Err(RegistryError::AlreadyConnected(identity.to_string()));
        }
        subscriber.link = LinkState::Active(link);
        subscriber.inbound.reset();
        Ok(())
    }

    /// Detach the live connection, keeping subscriptions and queue.
    ///
    /// Returns the detached link so the caller can release it.
    pub fn mark_disconnected(&mut self, identity: &str) -> Option<S> {
        let subscriber = self.subscribers.get_mut(identity)?;
        subscriber.inbound.reset();
        match std::mem::replace(&mut subscriber.link, LinkState::Disconnected) {
            LinkState::Active(link) => Some(link),
            LinkState::Disconnected => None,
        }
    }

    /// Detach every live connection.
    pub fn disconnect_all(&mut self) -> Vec<(String, S)> {
        let identities: Vec<String> = self
            .subscribers
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.identity.clone())
            .collect();
        identities
            .into_iter()
            .filter_map(|id| self.mark_disconnected(&id).map(|link| (id, link)))
            .collect()
    }

    pub fn subscribe(
        &mut self,
        identity: &str,
        pattern: &str,
        store_forward: bool,
    ) -> Result<(), RegistryError> {
        self.require(identity)?.subscribe(pattern, store_forward);
        Ok(())
    }

    pub fn unsubscribe(&mut self, identity: &str, pattern: &str) -> Result<bool, RegistryError> {
        Ok(self.require(identity)?.unsubscribe(pattern))
    }

    pub fn enqueue(&mut self, identity: &str, packet: Bytes) -> Result<(), RegistryError> {
        self.require(identity)?.store(packet)
    }

    pub fn drain_queue(&mut self, identity: &str) -> Result<Vec<Bytes>, RegistryError> {
        Ok(self.require(identity)?.drain_pending())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Sink that records packets, optionally failing every send.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub packets: Vec<Vec<u8>>,
        pub fail_with: Option<io::ErrorKind>,
    }

    impl PacketSink for RecordingSink {
        fn send_packet(&mut self, packet: &[u8]) -> io::Result<()> {
            if let Some(kind) = self.fail_with {
                return Err(io::Error::from(kind));
            }
            self.packets.push(packet.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_validate_identity() {
        assert_eq!(validate_identity(b"C1").unwrap(), "C1");
        assert_eq!(validate_identity(b"0123456789").unwrap(), "0123456789");
        assert_eq!(validate_identity(b""), Err(IdentityError::Empty));
        assert_eq!(
            validate_identity(b"0123456789a"),
            Err(IdentityError::TooLong(11))
        );
        assert_eq!(
            validate_identity(b"a\nb"),
            Err(IdentityError::InvalidCharacter)
        );
        assert_eq!(validate_identity(b"\xff\xfe"), Err(IdentityError::NotUtf8));
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut registry: SubscriberRegistry<RecordingSink> = SubscriberRegistry::new();
        registry.get_or_create("C1").subscribe("a", true);
        registry.get_or_create("C1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("C1").unwrap().subscription_count(), 1);
        assert!(!registry.is_connected("C1"));
    }

    #[test]
    fn test_mark_connected_rejects_active() {
        let mut registry = SubscriberRegistry::new();
        registry.get_or_create("C1");
        registry
            .mark_connected("C1", RecordingSink::default())
            .unwrap();
        assert_eq!(
            registry.mark_connected("C1", RecordingSink::default()),
            Err(RegistryError::AlreadyConnected("C1".to_string()))
        );
        assert_eq!(
            registry.mark_connected("nobody", RecordingSink::default()),
            Err(RegistryError::UnknownSubscriber("nobody".to_string()))
        );
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn test_disconnect_keeps_state() {
        let mut registry = SubscriberRegistry::new();
        registry.get_or_create("C1");
        registry
            .mark_connected("C1", RecordingSink::default())
            .unwrap();
        registry.subscribe("C1", "a/*", true).unwrap();
        registry
            .get_mut("C1")
            .unwrap()
            .inbound_mut()
            .write(b"partial")
            .unwrap();

        assert!(registry.mark_disconnected("C1").is_some());
        assert!(registry.mark_disconnected("C1").is_none());

        let sub = registry.get_mut("C1").unwrap();
        assert_eq!(sub.subscriptions().collect::<Vec<_>>(), vec![("a/*", true)]);
        assert!(sub.inbound_mut().is_empty());
    }

    #[test]
    fn test_subscribe_overwrites_flag() {
        let mut registry: SubscriberRegistry<RecordingSink> = SubscriberRegistry::new();
        registry.get_or_create("C1");
        registry.subscribe("C1", "t", true).unwrap();
        registry.subscribe("C1", "t", false).unwrap();
        let subs: Vec<_> = registry.get("C1").unwrap().subscriptions().collect();
        assert_eq!(subs, vec![("t", false)]);

        assert!(!registry.unsubscribe("C1", "missing").unwrap());
        assert!(registry.unsubscribe("C1", "t").unwrap());
        assert!(registry.subscribe("ghost", "t", true).is_err());
    }

    #[test]
    fn test_enqueue_and_drain_fifo() {
        let mut registry: SubscriberRegistry<RecordingSink> = SubscriberRegistry::new();
        registry.get_or_create("C1");
        registry.enqueue("C1", Bytes::from_static(b"one")).unwrap();
        registry.enqueue("C1", Bytes::from_static(b"two")).unwrap();

        let drained = registry.drain_queue("C1").unwrap();
        assert_eq!(drained, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert!(registry.drain_queue("C1").unwrap().is_empty());
    }

    #[test]
    fn test_enqueue_rejected_while_connected() {
        let mut registry = SubscriberRegistry::new();
        registry.get_or_create("C1");
        registry
            .mark_connected("C1", RecordingSink::default())
            .unwrap();
        assert_eq!(
            registry.enqueue("C1", Bytes::from_static(b"x")),
            Err(RegistryError::Connected("C1".to_string()))
        );
    }

    #[test]
    fn test_store_limit() {
        let mut registry: SubscriberRegistry<RecordingSink> =
            SubscriberRegistry::with_limits(64, 2);
        registry.get_or_create("C1");
        registry.enqueue("C1", Bytes::from_static(b"1")).unwrap();
        registry.enqueue("C1", Bytes::from_static(b"2")).unwrap();
        assert!(matches!(
            registry.enqueue("C1", Bytes::from_static(b"3")),
            Err(RegistryError::StoreFull { limit: 2, .. })
        ));
        assert_eq!(registry.get("C1").unwrap().pending_len(), 2);
        assert_eq!(
            registry.get_or_create("C1").inbound_mut().capacity(),
            64
        );
    }

    #[test]
    fn test_disconnect_all() {
        let mut registry = SubscriberRegistry::new();
        for id in ["A", "B", "C"] {
            registry.get_or_create(id);
        }
        registry.mark_connected("A", RecordingSink::default()).unwrap();
        registry.mark_connected("C", RecordingSink::default()).unwrap();

        let mut closed: Vec<String> = registry
            .disconnect_all()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        closed.sort();
        assert_eq!(closed, vec!["A", "C"]);
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_apply_commands() {
        let mut registry: SubscriberRegistry<RecordingSink> = SubscriberRegistry::new();
        let sub = registry.get_or_create("C1");
        sub.apply(Command::parse("subscribe a/+ 1").unwrap());
        sub.apply(Command::parse("subscribe b 0").unwrap());
        sub.apply(Command::parse("unsubscribe b").unwrap());
        assert_eq!(sub.subscriptions().collect::<Vec<_>>(), vec![("a/+", true)]);
    }
}
