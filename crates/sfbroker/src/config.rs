// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker configuration.
//!
//! Built from command-line arguments or loaded from a JSON file. Every field
//! has a default, so a partial file is valid.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::DEFAULT_COMMAND_BUFFER_CAPACITY;
use crate::router::DeliveryPolicy;
use crate::wire::{MAX_DATAGRAM_LEN, TOPIC_LEN};

/// Smallest command buffer that still holds one maximal command line.
const MIN_COMMAND_BUFFER_CAPACITY: usize = TOPIC_LEN + 32;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address to bind both sockets to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP and UDP port (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP listen backlog
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,

    /// Disable Nagle on subscriber connections
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// Per-connection command reassembly buffer (bytes)
    #[serde(default = "default_command_buffer_capacity")]
    pub command_buffer_capacity: usize,

    /// Unflushed outbound bytes allowed per connection before it is closed
    #[serde(default = "default_max_pending_output")]
    pub max_pending_output_bytes: usize,

    /// Store-and-forward queue limit per subscriber (0 = unlimited)
    #[serde(default)]
    pub max_stored_messages: usize,

    /// Seconds a new connection may take to send its identity (0 = no limit)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Store-and-forward selection when several patterns match
    #[serde(default)]
    pub delivery_policy: DeliveryPolicy,

    /// Accept the `exit` command on stdin
    #[serde(default = "default_true")]
    pub admin_stdin: bool,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    12345
}

fn default_listen_backlog() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_command_buffer_capacity() -> usize {
    DEFAULT_COMMAND_BUFFER_CAPACITY
}

fn default_max_pending_output() -> usize {
    4 * 1024 * 1024 // 4 MB
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            listen_backlog: default_listen_backlog(),
            tcp_nodelay: true,
            command_buffer_capacity: default_command_buffer_capacity(),
            max_pending_output_bytes: default_max_pending_output(),
            max_stored_messages: 0,
            handshake_timeout_secs: default_handshake_timeout(),
            delivery_policy: DeliveryPolicy::default(),
            admin_stdin: true,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Socket address both the TCP listener and UDP socket bind to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Handshake deadline, if enabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_secs > 0).then(|| Duration::from_secs(self.handshake_timeout_secs))
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_backlog <= 0 {
            return Err(ConfigError::Invalid(
                "listen_backlog must be positive".into(),
            ));
        }
        if self.command_buffer_capacity < MIN_COMMAND_BUFFER_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "command_buffer_capacity must be at least {}",
                MIN_COMMAND_BUFFER_CAPACITY
            )));
        }
        if self.max_pending_output_bytes < MAX_DATAGRAM_LEN * 2 {
            return Err(ConfigError::Invalid(format!(
                "max_pending_output_bytes must be at least {}",
                MAX_DATAGRAM_LEN * 2
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 12345);
        assert_eq!(config.command_buffer_capacity, 3200);
        assert_eq!(config.delivery_policy, DeliveryPolicy::FirstMatch);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(10)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{"port": 4000, "delivery_policy": "any_store_forward"}"#)
                .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.delivery_policy, DeliveryPolicy::AnyStoreForward);
        assert_eq!(config.listen_backlog, 100);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_validation() {
        let mut config = BrokerConfig {
            listen_backlog: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.listen_backlog = 10;
        config.command_buffer_capacity = 16;
        assert!(config.validate().is_err());

        config.command_buffer_capacity = 3200;
        config.max_pending_output_bytes = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_handshake_timeout_disabled() {
        let config = BrokerConfig {
            handshake_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.handshake_timeout(), None);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.json");

        let config = BrokerConfig {
            port: 5555,
            max_stored_messages: 64,
            ..Default::default()
        };
        config.to_file(&path).unwrap();
        assert_eq!(BrokerConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = BrokerConfig::from_file(Path::new("/nonexistent/broker.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
