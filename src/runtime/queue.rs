//! Outbound byte queue for a connection.
//!
//! `BufferQueue` holds pending `PooledBuffer`s in send order. A partial write
//! consumes bytes from the front through `erase`, which drops fully written
//! buffers and remembers how far into the new front buffer the peer has
//! already been served (the skip offset).
//!
//! Writes go out through `view`, a bounded scatter-gather snapshot of at most
//! `MAX_VIEW_BUFFERS` buffers. Buffers beyond that are picked up by later
//! writes.

use crate::runtime::buffer::PooledBuffer;
use std::collections::VecDeque;
use std::io::IoSlice;

/// Maximum number of buffers submitted in a single vectored write.
pub const MAX_VIEW_BUFFERS: usize = 4;

/// Ordered queue of pending outbound buffers.
#[derive(Debug, Default)]
pub struct BufferQueue {
    buffers: VecDeque<PooledBuffer>,
    /// Bytes of the front buffer already written.
    skip: usize,
    /// Unwritten bytes across all buffers.
    total: usize,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer. Empty buffers are ignored.
    pub fn push_back(&mut self, buffer: PooledBuffer) {
        if buffer.is_empty() {
            return;
        }
        self.total += buffer.len();
        self.buffers.push_back(buffer);
    }

    /// Append every buffer of `buffers` in order.
    pub fn add<I>(&mut self, buffers: I)
    where
        I: IntoIterator<Item = PooledBuffer>,
    {
        for buffer in buffers {
            self.push_back(buffer);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Unwritten bytes.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Offset into the front buffer.
    pub fn skip(&self) -> usize {
        self.skip
    }

    /// Number of queued buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.total = 0;
        self.skip = 0;
    }

    /// Whether another buffer still fits in the next `view`.
    pub fn may_add(&self) -> bool {
        self.buffers.len() < MAX_VIEW_BUFFERS
    }

    /// Consume `len` bytes from the front.
    ///
    /// # Panics
    /// Panics if `len` exceeds `total()`.
    pub fn erase(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        assert!(len <= self.total, "erase past the end of the queue");

        self.total -= len;
        let mut len = len + self.skip;
        self.skip = 0;

        while let Some(front) = self.buffers.front() {
            let current = front.len();
            if len < current {
                self.skip = len;
                break;
            }
            len -= current;
            self.buffers.pop_front();
            if len == 0 {
                break;
            }
        }
    }

    /// Snapshot of the first `MAX_VIEW_BUFFERS` buffers for one write.
    pub fn view(&self) -> BufferView {
        BufferView {
            buffers: self
                .buffers
                .iter()
                .take(MAX_VIEW_BUFFERS)
                .cloned()
                .collect(),
            skip: self.skip,
        }
    }
}

/// Read-only scatter-gather snapshot of the queue front.
///
/// Holds its own references to the buffers, so it can travel with a write
/// operation while the queue keeps changing under the connection lock.
#[derive(Debug, Clone)]
pub struct BufferView {
    buffers: Vec<PooledBuffer>,
    skip: usize,
}

impl BufferView {
    /// Number of buffers in the view.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes the view exposes.
    pub fn bytes(&self) -> usize {
        self.chunks().map(<[u8]>::len).sum()
    }

    /// Iterate the exposed chunks, honoring the skip offset.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.buffers
            .iter()
            .enumerate()
            .map(move |(i, b)| if i == 0 { &b[self.skip..] } else { &b[..] })
    }

    /// IoSlices for a vectored write; unused entries are empty.
    pub fn io_slices(&self) -> [IoSlice<'_>; MAX_VIEW_BUFFERS] {
        let mut slices = [IoSlice::new(&[]); MAX_VIEW_BUFFERS];
        for (slot, chunk) in slices.iter_mut().zip(self.chunks()) {
            *slot = IoSlice::new(chunk);
        }
        slices
    }
}

/// Fixed-size staging area that coalesces small sends.
///
/// A capacity of zero disables staging: `feed` always refuses.
#[derive(Debug)]
pub struct LazyBuffer {
    buffer: Box<[u8]>,
    pos: usize,
}

impl LazyBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
        }
    }

    /// Stage `input` if it fits in the remaining space.
    pub fn feed(&mut self, input: &[u8]) -> bool {
        if self.buffer.len() - self.pos >= input.len() && !self.buffer.is_empty() {
            self.buffer[self.pos..self.pos + input.len()].copy_from_slice(input);
            self.pos += input.len();
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Staged bytes.
    pub fn len(&self) -> usize {
        self.pos
    }

    /// Move the staged bytes into a pooled buffer and reset.
    pub fn commit(&mut self) -> PooledBuffer {
        let buffer = PooledBuffer::copy_from(&self.buffer[..self.pos]);
        self.pos = 0;
        buffer
    }

    pub fn clear(&mut self) {
        self.pos = 0;
    }
}
