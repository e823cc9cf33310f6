// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identity handshake for newly accepted connections.
//!
//! A subscriber opens with its identity followed by a NUL byte. Anything sent
//! after the NUL is already command traffic.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use crate::registry::{validate_identity, IdentityError, MAX_IDENTITY_LEN};

/// Result of reading from a connection that has not identified yet.
#[derive(Debug)]
pub enum HandshakeProgress {
    /// No NUL yet; wait for more bytes.
    Incomplete,
    /// Identity received. `leftover` holds bytes that followed the NUL.
    Identified { identity: String, leftover: Vec<u8> },
    /// Identity is unusable; close the connection.
    Rejected(IdentityError),
    /// Peer closed or the read failed.
    Closed,
}

/// Look for a complete identity in `received`.
///
/// Returns the identity and the number of bytes it occupied (including the
/// NUL), or `None` if more bytes are needed.
pub fn parse_identity(received: &[u8]) -> Option<Result<(String, usize), IdentityError>> {
    match received.iter().position(|&b| b == 0) {
        Some(nul) => Some(validate_identity(&received[..nul]).map(|id| (id, nul + 1))),
        None if received.len() > MAX_IDENTITY_LEN => {
            Some(Err(IdentityError::TooLong(received.len())))
        }
        None => None,
    }
}

/// Accepted connection awaiting its identity.
#[derive(Debug)]
pub struct PendingLink {
    stream: TcpStream,
    peer: SocketAddr,
    accepted_at: Instant,
    received: Vec<u8>,
}

impl PendingLink {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            accepted_at: Instant::now(),
            received: Vec::with_capacity(MAX_IDENTITY_LEN + 1),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.accepted_at) >= timeout
    }

    /// Read until the identity is complete or the socket would block.
    pub fn read_identity(&mut self, chunk: &mut [u8]) -> HandshakeProgress {
        loop {
            match self.stream.read(chunk) {
                Ok(0) => return HandshakeProgress::Closed,
                Ok(n) => {
                    self.received.extend_from_slice(&chunk[..n]);
                    match parse_identity(&self.received) {
                        Some(Ok((identity, used))) => {
                            let leftover = self.received.split_off(used);
                            return HandshakeProgress::Identified { identity, leftover };
                        }
                        Some(Err(e)) => return HandshakeProgress::Rejected(e),
                        None => {}
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeProgress::Incomplete
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return HandshakeProgress::Closed,
            }
        }
    }

    pub fn into_parts(self) -> (TcpStream, SocketAddr) {
        (self.stream, self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_identity_waits_for_nul() {
        assert!(parse_identity(b"").is_none());
        assert!(parse_identity(b"C1").is_none());
        assert!(parse_identity(b"0123456789").is_none());
    }

    #[test]
    fn test_parse_identity_complete() {
        let (id, used) = parse_identity(b"C1\0subscribe a 1\n").unwrap().unwrap();
        assert_eq!(id, "C1");
        assert_eq!(used, 3);
    }

    #[test]
    fn test_parse_identity_rejects() {
        assert_eq!(
            parse_identity(b"0123456789a").unwrap().unwrap_err(),
            IdentityError::TooLong(11)
        );
        assert_eq!(
            parse_identity(b"\0").unwrap().unwrap_err(),
            IdentityError::Empty
        );
        assert_eq!(
            parse_identity(b"a\rb\0").unwrap().unwrap_err(),
            IdentityError::InvalidCharacter
        );
    }

    #[test]
    fn test_read_identity_keeps_leftover() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();

        client.write_all(b"S1\0unsubscribe x\n").unwrap();
        client.flush().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut pending = PendingLink::new(TcpStream::from_std(server), peer);
        let mut chunk = [0u8; 64];
        let mut progress = pending.read_identity(&mut chunk);
        for _ in 0..100 {
            if !matches!(progress, HandshakeProgress::Incomplete) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            progress = pending.read_identity(&mut chunk);
        }
        match progress {
            HandshakeProgress::Identified { identity, leftover } => {
                assert_eq!(identity, "S1");
                assert_eq!(leftover, b"unsubscribe x\n");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expiry() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let pending = PendingLink::new(TcpStream::from_std(server), peer);
        let now = Instant::now();
        assert!(!pending.is_expired(Duration::from_secs(10), now));
        assert!(pending.is_expired(Duration::ZERO, now));
        assert!(pending.is_expired(Duration::from_secs(1), now + Duration::from_secs(2)));
    }
}
