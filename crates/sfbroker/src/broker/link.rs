// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live subscriber connection.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;

use crate::registry::PacketSink;

/// Compact the send queue once this many bytes have been written from it.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Non-blocking stream plus the bytes it has not yet accepted.
#[derive(Debug)]
pub struct Link {
    stream: TcpStream,
    peer: SocketAddr,
    send_queue: Vec<u8>,
    send_offset: usize,
    max_pending: usize,
    /// Set after a hard write error; later sends fail immediately.
    failed: Option<io::ErrorKind>,
}

impl Link {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_pending: usize) -> Self {
        Self {
            stream,
            peer,
            send_queue: Vec::new(),
            send_offset: 0,
            max_pending,
            failed: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// True once a send or flush has failed; the broker must close the link.
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// Bytes queued but not yet written to the socket.
    pub fn pending_bytes(&self) -> usize {
        self.send_queue.len() - self.send_offset
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// Write as much of the send queue as the socket accepts.
    ///
    /// `WouldBlock` is not an error: the rest goes out on the next writable
    /// event.
    pub fn flush_pending(&mut self) -> io::Result<()> {
        if let Some(kind) = self.failed {
            return Err(io::Error::from(kind));
        }

        while self.send_offset < self.send_queue.len() {
            match self.stream.write(&self.send_queue[self.send_offset..]) {
                Ok(0) => return Err(self.fail(io::ErrorKind::WriteZero.into())),
                Ok(n) => self.send_offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(e)),
            }
        }

        if self.send_offset == self.send_queue.len() {
            self.send_queue.clear();
            self.send_offset = 0;
        } else if self.send_offset >= COMPACT_THRESHOLD {
            self.send_queue.drain(..self.send_offset);
            self.send_offset = 0;
        }
        Ok(())
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        self.failed = Some(err.kind());
        self.send_queue.clear();
        self.send_offset = 0;
        err
    }
}

impl PacketSink for Link {
    fn send_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        if let Some(kind) = self.failed {
            return Err(io::Error::from(kind));
        }
        if self.pending_bytes() + packet.len() > self.max_pending {
            let err = io::Error::other(format!(
                "outbound queue full ({} bytes pending)",
                self.pending_bytes()
            ));
            return Err(self.fail(err));
        }
        self.send_queue.extend_from_slice(packet);
        self.flush_pending()
    }
}
