// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire formats.
//!
//! Two formats cross the broker:
//!
//! - [`datagram`]: what UDP publishers send (fixed 50-byte topic field).
//! - [`forward`]: what subscribers receive over TCP (length-prefixed,
//!   self-describing packet carrying the publisher address).

pub mod datagram;
pub mod forward;

use std::net::SocketAddr;

use thiserror::Error;

pub use datagram::{
    decode_datagram, encode_datagram, render_value, PayloadType, PayloadValue, PublishedMessage,
    ValueError, MAX_CONTENT_LEN, MAX_DATAGRAM_LEN, MIN_DATAGRAM_LEN, TOPIC_LEN,
};
pub use forward::{decode_forward_packet, encode_forward_packet, ForwardFrames};

/// Errors decoding a datagram or forward packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram too short: {0} bytes (need at least {min})", min = MIN_DATAGRAM_LEN)]
    DatagramTooShort(usize),

    #[error("truncated packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("declared length {declared} does not match contents ({actual})")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("packet of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("sender {0} is not an IPv4 address")]
    NonIpv4Sender(SocketAddr),
}

/// Errors building a datagram or forward packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("topic of {0} bytes does not fit")]
    TopicTooLong(usize),

    #[error("content of {0} bytes does not fit")]
    ContentTooLong(usize),

    #[error("value {0} out of range")]
    ValueOutOfRange(String),

    #[error("cannot encode unknown payload type {0}")]
    UnknownType(u8),
}
