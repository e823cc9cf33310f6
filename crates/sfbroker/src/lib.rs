// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Store-and-forward publish/subscribe broker.
//!
//! Publishers send typed datagrams over UDP; subscribers hold TCP
//! connections, identify themselves, and subscribe to hierarchical topic
//! patterns. Messages for a disconnected subscriber are kept and replayed on
//! reconnect when the matching subscription asked for it.
//!
//! # Features
//!
//! - **Wildcard topics**: `+` for one segment, `*` for any number
//! - **Store-and-forward**: per-subscription queueing across reconnects
//! - **Single-threaded**: one `mio` event loop, no locks
//!
//! # Quick Start
//!
//! ```bash
//! # Broker on port 12345 (TCP and UDP)
//! sfbroker 12345
//!
//! # Subscriber
//! sfbroker-subscriber C1 127.0.0.1 12345
//! subscribe upb/+/temperature 1
//!
//! # Publisher
//! sfbroker-publish --broker 127.0.0.1:12345 upb/ec/temperature short-real 21.50
//! ```
//!
//! # Configuration File
//!
//! ```json
//! {
//!   "port": 12345,
//!   "delivery_policy": "first_match",
//!   "max_stored_messages": 10000,
//!   "handshake_timeout_secs": 10
//! }
//! ```

pub mod broker;
pub mod buffer;
pub mod command;
pub mod config;
pub mod registry;
pub mod router;
pub mod topic;
pub mod wire;

pub use broker::{Broker, BrokerError, BrokerStats, ShutdownHandle};
pub use buffer::{BufferOverflow, CommandBuffer};
pub use command::{Command, CommandError};
pub use config::{BrokerConfig, ConfigError};
pub use registry::{PacketSink, Subscriber, SubscriberRegistry, MAX_IDENTITY_LEN};
pub use router::{DeliveryPolicy, Distribution, RouteStats, Router};
pub use topic::topic_matches;
pub use wire::{DecodeError, EncodeError, PayloadType, PayloadValue, PublishedMessage};
