// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fan-out of published messages to subscribers.
//!
//! For every subscriber with a matching subscription the router picks exactly
//! one outcome:
//!
//! 1. connected: the forward packet is sent now
//! 2. disconnected with store-and-forward: the packet is queued
//! 3. otherwise: the message is dropped for that subscriber
//!
//! A subscriber never receives the same datagram twice, however many of its
//! patterns match.

use std::io;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::registry::{PacketSink, Subscriber, SubscriberRegistry};
use crate::topic::topic_matches;
use crate::wire::{encode_forward_packet, EncodeError, PublishedMessage};

/// How the store-and-forward flag is chosen when several patterns match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// The first matching pattern (in pattern order) decides.
    #[default]
    FirstMatch,
    /// Store if any matching pattern has store-and-forward enabled.
    AnyStoreForward,
}

/// Outcome counts for one datagram.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Distribution {
    pub delivered: usize,
    pub stored: usize,
    pub dropped: usize,
    pub send_failures: usize,
}

/// Cumulative routing statistics.
#[derive(Debug, Default, Clone)]
pub struct RouteStats {
    /// Messages routed.
    pub messages_routed: u64,
    /// Packets handed to live connections.
    pub packets_delivered: u64,
    /// Bytes handed to live connections.
    pub bytes_delivered: u64,
    /// Packets queued for disconnected subscribers.
    pub packets_stored: u64,
    /// Matches dropped (disconnected without store-and-forward, or queue full).
    pub packets_dropped: u64,
    /// Sends that failed on a live connection.
    pub send_errors: u64,
}

/// Routes decoded messages through a [`SubscriberRegistry`].
#[derive(Debug, Default)]
pub struct Router {
    policy: DeliveryPolicy,
    stats: RouteStats,
}

/// Store-and-forward flag for `topic`, or `None` if nothing matches.
fn select_route<S>(
    subscriber: &Subscriber<S>,
    topic: &str,
    policy: DeliveryPolicy,
) -> Option<bool> {
    let mut matches = subscriber
        .subscriptions()
        .filter(|(pattern, _)| topic_matches(topic, pattern))
        .map(|(_, sf)| sf);

    match policy {
        DeliveryPolicy::FirstMatch => matches.next(),
        DeliveryPolicy::AnyStoreForward => matches.reduce(|a, b| a || b),
    }
}

fn log_send_failure(identity: &str, err: &io::Error) {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => {
            debug!("send to {} failed: {}", identity, err);
        }
        _ => warn!("send to {} failed: {}", identity, err),
    }
}

impl Router {
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            policy,
            stats: RouteStats::default(),
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    pub fn stats(&self) -> &RouteStats {
        &self.stats
    }

    /// Deliver, store, or drop `message` for every subscriber.
    ///
    /// The forward packet is encoded once and shared by every recipient.
    /// Send failures are logged and counted; they never abort the fan-out.
    pub fn distribute<S: PacketSink>(
        &mut self,
        registry: &mut SubscriberRegistry<S>,
        message: &PublishedMessage,
    ) -> Result<Distribution, EncodeError> {
        let packet = encode_forward_packet(message)?;
        let mut outcome = Distribution::default();
        self.stats.messages_routed += 1;

        for subscriber in registry.iter_mut() {
            let Some(store_forward) = select_route(subscriber, &message.topic, self.policy) else {
                continue;
            };

            if let Some(link) = subscriber.link_mut() {
                match link.send_packet(&packet) {
                    Ok(()) => {
                        outcome.delivered += 1;
                        self.stats.packets_delivered += 1;
                        self.stats.bytes_delivered += packet.len() as u64;
                    }
                    Err(e) => {
                        log_send_failure(subscriber.identity(), &e);
                        outcome.send_failures += 1;
                        self.stats.send_errors += 1;
                    }
                }
            } else if store_forward {
                match subscriber.store(packet.clone()) {
                    Ok(()) => {
                        trace!("stored packet for {}", subscriber.identity());
                        outcome.stored += 1;
                        self.stats.packets_stored += 1;
                    }
                    Err(e) => {
                        warn!("{}", e);
                        outcome.dropped += 1;
                        self.stats.packets_dropped += 1;
                    }
                }
            } else {
                outcome.dropped += 1;
                self.stats.packets_dropped += 1;
            }
        }

        debug!(
            "{} from {}: delivered={} stored={} dropped={} failed={}",
            message.topic,
            message.sender,
            outcome.delivered,
            outcome.stored,
            outcome.dropped,
            outcome.send_failures
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::RecordingSink;
    use crate::wire::decode_forward_packet;
    use bytes::Bytes;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn message(topic: &str) -> PublishedMessage {
        PublishedMessage {
            sender: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000),
            topic: topic.to_string(),
            type_tag: 3,
            content: Bytes::from_static(b"payload"),
        }
    }

    fn connected(registry: &mut SubscriberRegistry<RecordingSink>, id: &str) {
        registry.get_or_create(id);
        registry.mark_connected(id, RecordingSink::default()).unwrap();
    }

    fn sent(registry: &SubscriberRegistry<RecordingSink>, id: &str) -> usize {
        registry.get(id).unwrap().link().map_or(0, |s| s.packets.len())
    }

    #[test]
    fn test_delivers_to_connected_match() {
        let mut registry = SubscriberRegistry::new();
        connected(&mut registry, "C1");
        registry.subscribe("C1", "a/+", false).unwrap();
        connected(&mut registry, "C2");
        registry.subscribe("C2", "b", false).unwrap();

        let mut router = Router::default();
        let outcome = router.distribute(&mut registry, &message("a/x")).unwrap();

        assert_eq!(outcome.delivered, 1);
        assert_eq!(sent(&registry, "C1"), 1);
        assert_eq!(sent(&registry, "C2"), 0);

        let packet = &registry.get("C1").unwrap().link().unwrap().packets[0];
        let (decoded, _) = decode_forward_packet(packet).unwrap();
        assert_eq!(decoded, message("a/x"));
    }

    #[test]
    fn test_overlapping_patterns_deliver_once() {
        let mut registry = SubscriberRegistry::new();
        connected(&mut registry, "C1");
        registry.subscribe("C1", "a/*", false).unwrap();
        registry.subscribe("C1", "a/+", true).unwrap();
        registry.subscribe("C1", "*", false).unwrap();

        let mut router = Router::default();
        router.distribute(&mut registry, &message("a/b")).unwrap();
        assert_eq!(sent(&registry, "C1"), 1);
    }

    #[test]
    fn test_stores_for_disconnected_sf() {
        let mut registry: SubscriberRegistry<RecordingSink> = SubscriberRegistry::new();
        registry.get_or_create("C1");
        registry.subscribe("C1", "t", true).unwrap();
        registry.get_or_create("C2");
        registry.subscribe("C2", "t", false).unwrap();

        let mut router = Router::default();
        let outcome = router.distribute(&mut registry, &message("t")).unwrap();

        assert_eq!(outcome.stored, 1);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(registry.get("C1").unwrap().pending_len(), 1);
        assert_eq!(registry.get("C2").unwrap().pending_len(), 0);
        assert_eq!(router.stats().packets_stored, 1);
        assert_eq!(router.stats().packets_dropped, 1);
    }

    #[test]
    fn test_first_match_policy_uses_pattern_order() {
        // "a/*" sorts before "a/b"
        let mut registry: SubscriberRegistry<RecordingSink> = SubscriberRegistry::new();
        registry.get_or_create("C1");
        registry.subscribe("C1", "a/*", false).unwrap();
        registry.subscribe("C1", "a/b", true).unwrap();

        let mut router = Router::new(DeliveryPolicy::FirstMatch);
        let outcome = router.distribute(&mut registry, &message("a/b")).unwrap();
        assert_eq!(outcome.dropped, 1);
        assert_eq!(registry.get("C1").unwrap().pending_len(), 0);
    }

    #[test]
    fn test_any_store_forward_policy() {
        let mut registry: SubscriberRegistry<RecordingSink> = SubscriberRegistry::new();
        registry.get_or_create("C1");
        registry.subscribe("C1", "a/*", false).unwrap();
        registry.subscribe("C1", "a/b", true).unwrap();

        let mut router = Router::new(DeliveryPolicy::AnyStoreForward);
        let outcome = router.distribute(&mut registry, &message("a/b")).unwrap();
        assert_eq!(outcome.stored, 1);
        assert_eq!(registry.get("C1").unwrap().pending_len(), 1);
    }

    #[test]
    fn test_send_failure_is_counted_not_fatal() {
        let mut registry = SubscriberRegistry::new();
        registry.get_or_create("bad");
        registry
            .mark_connected(
                "bad",
                RecordingSink {
                    fail_with: Some(io::ErrorKind::BrokenPipe),
                    ..Default::default()
                },
            )
            .unwrap();
        registry.subscribe("bad", "t", true).unwrap();
        connected(&mut registry, "good");
        registry.subscribe("good", "t", false).unwrap();

        let mut router = Router::default();
        let outcome = router.distribute(&mut registry, &message("t")).unwrap();
        assert_eq!(outcome.send_failures, 1);
        assert_eq!(outcome.delivered, 1);
        // a failed live send is not converted into a stored packet
        assert_eq!(registry.get("bad").unwrap().pending_len(), 0);
        assert_eq!(router.stats().send_errors, 1);
    }

    #[test]
    fn test_no_match_touches_nothing() {
        let mut registry = SubscriberRegistry::new();
        connected(&mut registry, "C1");
        registry.subscribe("C1", "x/y", true).unwrap();

        let mut router = Router::default();
        let outcome = router.distribute(&mut registry, &message("x")).unwrap();
        assert_eq!(outcome, Distribution::default());
        assert_eq!(router.stats().messages_routed, 1);
    }
}
