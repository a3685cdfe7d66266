//! Chunk assembly
//!
//! Network reads and file reads arrive in arbitrary sizes; the stream cipher
//! consumes fixed-size chunks. [`ChunkAssembler`] reconciles the two: bytes
//! are pushed in whatever spans the source produces and drained as
//! encryption-aligned chunks, with the trailing remainder taken separately at
//! end of stream. It is source-agnostic and never yields an empty slice.

use bytes::{Bytes, BytesMut};

/// Accumulates byte spans and yields fixed-size chunks
#[derive(Default)]
pub struct ChunkAssembler {
    buffer: BytesMut,
}

impl ChunkAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Append a span of bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drain all complete chunks of `chunk_size` bytes
    ///
    /// Bytes short of a full chunk stay buffered.
    pub fn drain(&mut self, chunk_size: usize) -> Vec<Bytes> {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        let mut chunks = Vec::new();
        while self.buffer.len() >= chunk_size {
            chunks.push(self.buffer.split_to(chunk_size).freeze());
        }
        chunks
    }

    /// Take whatever is left, if anything
    pub fn take_remainder(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    /// Discard all buffered bytes
    ///
    /// Used when a transfer is re-issued from a committed offset and buffered
    /// uncommitted bytes will be fetched again.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
