// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded byte queue for reassembling subscriber command lines.

use std::collections::VecDeque;

use thiserror::Error;

/// Network read size; the default capacity holds two full reads.
pub const READ_CHUNK_SIZE: usize = 1600;

/// Default command buffer capacity.
pub const DEFAULT_COMMAND_BUFFER_CAPACITY: usize = 2 * READ_CHUNK_SIZE;

/// A write would exceed the buffer capacity. Nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("command buffer overflow: {attempted} bytes into {free} free")]
pub struct BufferOverflow {
    pub attempted: usize,
    pub free: usize,
}

/// Fixed-capacity FIFO of bytes.
///
/// Writes are all-or-nothing; the buffer never grows past its capacity.
#[derive(Debug)]
pub struct CommandBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_BUFFER_CAPACITY)
    }
}

impl CommandBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free space in bytes.
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Append `bytes`, or fail without modifying the buffer.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferOverflow> {
        if bytes.len() > self.remaining() {
            return Err(BufferOverflow {
                attempted: bytes.len(),
                free: self.remaining(),
            });
        }
        self.data.extend(bytes);
        Ok(())
    }

    /// Position of the first `byte`, if buffered.
    pub fn find(&self, byte: u8) -> Option<usize> {
        self.data.iter().position(|&b| b == byte)
    }

    /// Copy out up to `len` leading bytes without consuming them.
    pub fn peek(&self, len: usize) -> Vec<u8> {
        self.data.iter().take(len).copied().collect()
    }

    /// Discard up to `n` leading bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    /// Remove and return the next `\n`-terminated line, without the `\n`.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.find(b'\n')?;
        let line: Vec<u8> = self.data.drain(..=end).take(end).collect();
        Some(line)
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }
}
