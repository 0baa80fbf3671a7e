//! Per-server reader cursor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::domain::ports::ServerAddress;
use crate::domain::query::{ReaderChunk, ReaderRow};

/// Forward-only cursor over one server's slice of a reader.
#[derive(Debug)]
pub struct PartitionCursor {
    pub server: ServerAddress,
    pub reader_id: String,
    next_index: u64,
    buffer: VecDeque<ReaderRow>,
    /// Server has no more rows for this reader
    exhausted: bool,
    valid: Arc<AtomicBool>,
}

impl PartitionCursor {
    pub fn from_chunk(chunk: ReaderChunk, valid: Arc<AtomicBool>) -> Self {
        let mut cursor = Self {
            server: chunk.server.clone(),
            reader_id: chunk.reader_id.clone(),
            next_index: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            valid,
        };
        cursor.push_chunk(chunk);
        cursor
    }

    /// Append a fetched chunk. An empty chunk ends the partition.
    pub fn push_chunk(&mut self, chunk: ReaderChunk) {
        self.exhausted = chunk.is_last || chunk.rows.is_empty();
        self.next_index = chunk.next_index;
        self.buffer.extend(chunk.rows);
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Buffer is empty and more rows can be requested.
    pub fn needs_fetch(&self) -> bool {
        self.buffer.is_empty() && !self.exhausted && self.is_valid()
    }

    /// Nothing left to deliver. Buffered rows of an invalidated partition
    /// are still delivered; nothing further is requested.
    pub fn is_done(&self) -> bool {
        self.buffer.is_empty() && (self.exhausted || !self.is_valid())
    }

    /// The server still holds resources for this partition.
    pub fn holds_server_state(&self) -> bool {
        !self.exhausted && self.is_valid()
    }

    pub fn peek(&self) -> Option<&ReaderRow> {
        self.buffer.front()
    }

    pub fn pop(&mut self) -> Option<ReaderRow> {
        self.buffer.pop_front()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
