// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher datagrams and typed payload values.
//!
//! ```text
//! offset 0           50        51                 51 + n
//! +-------------------+---------+------------------+
//! | topic (NUL pad)   | type    | content (<=1500) |
//! +-------------------+---------+------------------+
//! ```

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};

use bytes::Bytes;

use super::{DecodeError, EncodeError};

/// Size of the fixed topic field.
pub const TOPIC_LEN: usize = 50;

/// Offset of the payload type byte.
pub const TYPE_OFFSET: usize = TOPIC_LEN;

/// Shortest datagram that carries a type byte.
pub const MIN_DATAGRAM_LEN: usize = TYPE_OFFSET + 1;

/// Content beyond this many bytes is discarded.
pub const MAX_CONTENT_LEN: usize = 1500;

/// Largest datagram the broker ever needs to read in full.
pub const MAX_DATAGRAM_LEN: usize = MIN_DATAGRAM_LEN + MAX_CONTENT_LEN;

/// Marker rendered when content is too short for its type.
pub const INVALID_DATA: &str = "INVALID DATA";

/// Marker rendered when a sign byte is neither 0 nor 1.
pub const INVALID_SIGN: &str = "INVALID SIGN BYTE";

// ============================================================================
// Payload types
// ============================================================================

/// Known payload type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// Sign byte + u32 magnitude.
    Int = 0,
    /// u16 hundredths.
    ShortReal = 1,
    /// Sign byte + u32 magnitude + u8 negative power of ten.
    Float = 2,
    /// Raw text.
    String = 3,
}

impl PayloadType {
    /// Map a wire tag to a known type.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Int),
            1 => Some(Self::ShortReal),
            2 => Some(Self::Float),
            3 => Some(Self::String),
            _ => None,
        }
    }

    /// Wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Upper-case name used in rendered lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::Int => "INT",
            Self::ShortReal => "SHORT_REAL",
            Self::Float => "FLOAT",
            Self::String => "STRING",
        }
    }
}

/// Why content could not be interpreted as its declared type.
///
/// The `Display` output is the marker printed in place of the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("INVALID DATA")]
    InvalidData,
    #[error("INVALID SIGN BYTE")]
    InvalidSign,
}

/// Decoded payload content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadValue {
    /// Signed integer; the magnitude always fits in a `u32`.
    Int(i64),
    /// Non-negative value in hundredths.
    ShortReal(u16),
    /// `(-1)^negative * magnitude * 10^-power`.
    Float {
        negative: bool,
        magnitude: u32,
        power: u8,
    },
    /// Text content.
    String(String),
    /// Tag with no known interpretation.
    Unknown(u8),
}

fn sign_of(byte: u8) -> Result<bool, ValueError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ValueError::InvalidSign),
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl PayloadValue {
    /// Interpret `content` according to the wire `tag`.
    pub fn decode(tag: u8, content: &[u8]) -> Result<Self, ValueError> {
        let Some(kind) = PayloadType::from_tag(tag) else {
            return Ok(Self::Unknown(tag));
        };

        match kind {
            PayloadType::Int => {
                if content.len() < 5 {
                    return Err(ValueError::InvalidData);
                }
                let negative = sign_of(content[0])?;
                let magnitude = i64::from(be_u32(&content[1..5]));
                Ok(Self::Int(if negative { -magnitude } else { magnitude }))
            }
            PayloadType::ShortReal => {
                if content.len() < 2 {
                    return Err(ValueError::InvalidData);
                }
                Ok(Self::ShortReal(u16::from_be_bytes([content[0], content[1]])))
            }
            PayloadType::Float => {
                if content.len() < 6 {
                    return Err(ValueError::InvalidData);
                }
                Ok(Self::Float {
                    negative: sign_of(content[0])?,
                    magnitude: be_u32(&content[1..5]),
                    power: content[5],
                })
            }
            PayloadType::String => Ok(Self::String(String::from_utf8_lossy(content).into_owned())),
        }
    }

    /// Wire tag of this value.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Int(_) => PayloadType::Int.tag(),
            Self::ShortReal(_) => PayloadType::ShortReal.tag(),
            Self::Float { .. } => PayloadType::Float.tag(),
            Self::String(_) => PayloadType::String.tag(),
            Self::Unknown(tag) => *tag,
        }
    }

    /// Encode the content bytes (without topic or type).
    pub fn encode_content(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            Self::Int(value) => {
                let magnitude = u32::try_from(value.unsigned_abs())
                    .map_err(|_| EncodeError::ValueOutOfRange(value.to_string()))?;
                let mut out = Vec::with_capacity(5);
                out.push(u8::from(*value < 0));
                out.extend_from_slice(&magnitude.to_be_bytes());
                Ok(out)
            }
            Self::ShortReal(hundredths) => Ok(hundredths.to_be_bytes().to_vec()),
            Self::Float {
                negative,
                magnitude,
                power,
            } => {
                let mut out = Vec::with_capacity(6);
                out.push(u8::from(*negative));
                out.extend_from_slice(&magnitude.to_be_bytes());
                out.push(*power);
                Ok(out)
            }
            Self::String(text) => {
                if text.len() > MAX_CONTENT_LEN {
                    return Err(EncodeError::ContentTooLong(text.len()));
                }
                Ok(text.as_bytes().to_vec())
            }
            Self::Unknown(tag) => Err(EncodeError::UnknownType(*tag)),
        }
    }
}

/// Write `magnitude` with a decimal point `power` places from the right.
fn write_scaled(
    f: &mut fmt::Formatter<'_>,
    negative: bool,
    magnitude: u64,
    power: usize,
) -> fmt::Result {
    if negative && magnitude != 0 {
        f.write_str("-")?;
    }
    let digits = magnitude.to_string();
    if power == 0 {
        return f.write_str(&digits);
    }
    if digits.len() > power {
        let (int, frac) = digits.split_at(digits.len() - power);
        write!(f, "{int}.{frac}")
    } else {
        write!(f, "0.{digits:0>power$}")
    }
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::ShortReal(hundredths) => write_scaled(f, false, u64::from(*hundredths), 2),
            Self::Float {
                negative,
                magnitude,
                power,
            } => write_scaled(f, *negative, u64::from(*magnitude), usize::from(*power)),
            Self::String(text) => f.write_str(text),
            Self::Unknown(tag) => write!(f, "UNKNOWN TYPE ({tag})"),
        }
    }
}

/// Render content for display, substituting the error marker on failure.
pub fn render_value(tag: u8, content: &[u8]) -> String {
    match PayloadValue::decode(tag, content) {
        Ok(value) => value.to_string(),
        Err(e) => e.to_string(),
    }
}

// ============================================================================
// Published messages
// ============================================================================

/// A publication as received from a UDP publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Publisher address.
    pub sender: SocketAddrV4,
    /// Topic, at most [`TOPIC_LEN`] bytes.
    pub topic: String,
    /// Raw type tag (unknown tags are carried through).
    pub type_tag: u8,
    /// Content, at most [`MAX_CONTENT_LEN`] bytes.
    pub content: Bytes,
}

impl PublishedMessage {
    /// Known payload type, if any.
    pub fn payload_type(&self) -> Option<PayloadType> {
        PayloadType::from_tag(self.type_tag)
    }

    /// Human-readable line: `ip:port - topic - TYPE - value`.
    pub fn render(&self) -> String {
        match self.payload_type() {
            Some(kind) => format!(
                "{} - {} - {} - {}",
                self.sender,
                self.topic,
                kind.name(),
                render_value(self.type_tag, &self.content)
            ),
            None => format!(
                "{} - {} - UNKNOWN TYPE ({})",
                self.sender, self.topic, self.type_tag
            ),
        }
    }
}

/// Convert a sender address to IPv4, accepting IPv4-mapped IPv6.
pub(crate) fn ipv4_sender(sender: SocketAddr) -> Result<SocketAddrV4, DecodeError> {
    match sender {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port()))
            .ok_or(DecodeError::NonIpv4Sender(sender)),
    }
}

/// Parse a publisher datagram.
pub fn decode_datagram(
    datagram: &[u8],
    sender: SocketAddr,
) -> Result<PublishedMessage, DecodeError> {
    if datagram.len() < MIN_DATAGRAM_LEN {
        return Err(DecodeError::DatagramTooShort(datagram.len()));
    }
    let sender = ipv4_sender(sender)?;

    let field = &datagram[..TOPIC_LEN];
    let topic_len = field.iter().position(|&b| b == 0).unwrap_or(TOPIC_LEN);
    let topic = String::from_utf8_lossy(&field[..topic_len]).into_owned();

    let content = &datagram[MIN_DATAGRAM_LEN..];
    let content = &content[..content.len().min(MAX_CONTENT_LEN)];

    Ok(PublishedMessage {
        sender,
        topic,
        type_tag: datagram[TYPE_OFFSET],
        content: Bytes::copy_from_slice(content),
    })
}

/// Build a publisher datagram for `topic` carrying `value`.
pub fn encode_datagram(topic: &str, value: &PayloadValue) -> Result<Vec<u8>, EncodeError> {
    if topic.len() > TOPIC_LEN {
        return Err(EncodeError::TopicTooLong(topic.len()));
    }
    let content = value.encode_content()?;

    let mut out = vec![0u8; MIN_DATAGRAM_LEN];
    out[..topic.len()].copy_from_slice(topic.as_bytes());
    out[TYPE_OFFSET] = value.tag();
    out.extend_from_slice(&content);
    Ok(out)
}
