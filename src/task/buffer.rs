//! Per-task output buffer.
//!
//! Engine deltas are raw bytes and may end in the middle of a UTF-8
//! sequence. Bytes are held back until the buffer is past
//! [`FLUSH_THRESHOLD`] and decodes as valid UTF-8; the final flush at task
//! finish releases whatever is left, valid or not.

use crate::protocol::ResultFrame;
use crate::task::TaskId;

/// Buffered bytes must exceed this before an opportunistic flush.
pub const FLUSH_THRESHOLD: usize = 30;

const INITIAL_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct TextBuffer {
    id: TaskId,
    pending: Vec<u8>,
}

impl TextBuffer {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            pending: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Append a delta. Returns a chunk to send when the buffer is large
    /// enough and its contents are complete text.
    pub fn append(&mut self, bytes: &[u8]) -> Option<ResultFrame> {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > FLUSH_THRESHOLD && std::str::from_utf8(&self.pending).is_ok() {
            return self.flush();
        }
        None
    }

    /// Drain everything buffered into a chunk. `None` when empty.
    pub fn flush(&mut self) -> Option<ResultFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let payload = std::mem::take(&mut self.pending);
        Some(ResultFrame::chunk(self.id, payload))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
