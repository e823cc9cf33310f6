// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Forward packets sent from the broker to subscribers.
//!
//! ```text
//! +-------------+----------+----------+-----------+-------+------+-------------+---------+
//! | len (u32BE) | ip (4B)  | port u16 | tlen (u8) | topic | type | clen u16 BE | content |
//! +-------------+----------+----------+-----------+-------+------+-------------+---------+
//! ```
//!
//! `len` counts every byte after itself. All integers are big-endian.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use super::{DecodeError, EncodeError, PublishedMessage};

/// Size of the leading length field.
pub const FORWARD_HEADER_LEN: usize = 4;

/// Bytes of fixed-size fields inside the payload (ip, port, tlen, type, clen).
const FIXED_PAYLOAD_LEN: usize = 4 + 2 + 1 + 1 + 2;

/// Largest payload any valid packet can declare.
pub const MAX_FORWARD_PAYLOAD: usize = FIXED_PAYLOAD_LEN + u8::MAX as usize + u16::MAX as usize;

/// Serialize a message into a forward packet.
pub fn encode_forward_packet(msg: &PublishedMessage) -> Result<Bytes, EncodeError> {
    let topic = msg.topic.as_bytes();
    let topic_len = u8::try_from(topic.len()).map_err(|_| EncodeError::TopicTooLong(topic.len()))?;
    let content_len = u16::try_from(msg.content.len())
        .map_err(|_| EncodeError::ContentTooLong(msg.content.len()))?;

    let payload_len = FIXED_PAYLOAD_LEN + topic.len() + msg.content.len();
    let mut buf = BytesMut::with_capacity(FORWARD_HEADER_LEN + payload_len);
    // payload_len <= MAX_FORWARD_PAYLOAD, well within u32
    buf.put_u32(payload_len as u32);
    buf.put_slice(&msg.sender.ip().octets());
    buf.put_u16(msg.sender.port());
    buf.put_u8(topic_len);
    buf.put_slice(topic);
    buf.put_u8(msg.type_tag);
    buf.put_u16(content_len);
    buf.put_slice(&msg.content);
    Ok(buf.freeze())
}

/// Bounds-checked reader over a byte slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Decode one forward packet from the start of `buf`.
///
/// Returns the message and the number of bytes consumed. Never reads past
/// the end of `buf`.
pub fn decode_forward_packet(buf: &[u8]) -> Result<(PublishedMessage, usize), DecodeError> {
    let mut cur = Cursor { buf, pos: 0 };
    let declared = cur.u32()? as usize;
    if declared > MAX_FORWARD_PAYLOAD {
        return Err(DecodeError::TooLarge {
            size: declared,
            max: MAX_FORWARD_PAYLOAD,
        });
    }
    let total = FORWARD_HEADER_LEN + declared;
    if buf.len() < total {
        return Err(DecodeError::Truncated {
            needed: total,
            available: buf.len(),
        });
    }

    // Confine the field reads to the declared packet
    let mut cur = Cursor {
        buf: &buf[..total],
        pos: FORWARD_HEADER_LEN,
    };
    let ip = cur.take(4)?;
    let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
    let port = cur.u16()?;
    let topic_len = cur.u8()? as usize;
    let topic = String::from_utf8_lossy(cur.take(topic_len)?).into_owned();
    let type_tag = cur.u8()?;
    let content_len = cur.u16()? as usize;
    let content = Bytes::copy_from_slice(cur.take(content_len)?);

    if cur.pos != total {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: cur.pos - FORWARD_HEADER_LEN,
        });
    }

    let msg = PublishedMessage {
        sender: SocketAddrV4::new(ip, port),
        topic,
        type_tag,
        content,
    };
    Ok((msg, total))
}

/// Incremental forward packet decoder for a TCP byte stream.
///
/// Feed raw bytes as they arrive and pop complete messages.
#[derive(Debug)]
pub struct ForwardFrames {
    buffer: BytesMut,
    max_payload: usize,
    frames_decoded: u64,
}

impl Default for ForwardFrames {
    fn default() -> Self {
        Self::new(MAX_FORWARD_PAYLOAD)
    }
}

impl ForwardFrames {
    /// Create a decoder that rejects payloads above `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_payload: max_payload.min(MAX_FORWARD_PAYLOAD),
            frames_decoded: 0,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Packets decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Pop the next complete message.
    ///
    /// Returns `None` while a packet is still incomplete. An error means the
    /// stream is corrupt; the caller should drop the connection.
    pub fn next_message(&mut self) -> Option<Result<PublishedMessage, DecodeError>> {
        if self.buffer.len() < FORWARD_HEADER_LEN {
            return None;
        }
        let declared = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if declared > self.max_payload {
            return Some(Err(DecodeError::TooLarge {
                size: declared,
                max: self.max_payload,
            }));
        }
        if self.buffer.len() < FORWARD_HEADER_LEN + declared {
            return None;
        }

        let frame = self.buffer.split_to(FORWARD_HEADER_LEN + declared);
        self.frames_decoded += 1;
        Some(decode_forward_packet(&frame).map(|(msg, _)| msg))
    }

    /// Drop any buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
