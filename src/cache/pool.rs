//! Frame buffer pool
//!
//! Buffers are keyed by exact capacity: a frame of `n` bytes only ever reuses
//! a buffer that was allocated with exactly `n` bytes. The decode worker
//! acquires, the consumer releases, so every operation runs under one lock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// What to do with pooled buffers whose capacity no longer matches requests.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Leave them pooled until the pool is cleared.
    Retain,
    /// On every acquire miss, drop the oldest mismatched buffer.
    #[default]
    EvictOldestOnMismatch,
}

/// A fixed-capacity byte buffer holding at most one encoded frame.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    filled: usize,
    serial: u64,
}

impl FrameBuffer {
    fn allocate(size: usize, serial: u64) -> Self {
        Self {
            data: vec![0u8; size],
            filled: 0,
            serial,
        }
    }

    /// Allocation size in bytes. Never changes over the buffer's life.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes holding frame content.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Frame content, starting at byte 0.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Identity of the underlying allocation, stable across pool round trips.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Mark the first `len` bytes as content and hand them out for writing.
    pub(crate) fn fill(&mut self, len: usize) -> &mut [u8] {
        let len = len.min(self.data.len());
        self.filled = len;
        &mut self.data[..len]
    }

    /// Overwrite one content byte in place.
    pub(crate) fn patch(&mut self, offset: usize, value: u8) {
        if offset < self.filled {
            self.data[offset] = value;
        }
    }

    fn clear(&mut self) {
        self.filled = 0;
    }
}

impl AsRef<[u8]> for FrameBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub allocations: u64,
    pub reuses: u64,
    /// Released buffers dropped because the pool was full.
    pub dropped: u64,
    /// Pooled buffers dropped by the stale policy.
    pub evicted: u64,
}

struct PoolInner {
    free: VecDeque<FrameBuffer>,
    next_serial: u64,
    stats: PoolStats,
}

/// Thread-safe pool of free frame buffers.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    max_buffers: usize,
    policy: StalePolicy,
}

impl BufferPool {
    /// Create a pool that keeps at most `max_buffers` free buffers.
    pub fn new(max_buffers: usize, policy: StalePolicy) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: VecDeque::with_capacity(max_buffers),
                next_serial: 0,
                stats: PoolStats::default(),
            }),
            max_buffers,
            policy,
        }
    }

    /// Take a free buffer of exactly `size` bytes, allocating if none is pooled.
    pub fn acquire(&self, size: usize) -> FrameBuffer {
        let mut inner = self.inner.lock();

        // Most recently released first
        if let Some(pos) = inner.free.iter().rposition(|b| b.capacity() == size) {
            if let Some(buffer) = inner.free.remove(pos) {
                inner.stats.reuses += 1;
                return buffer;
            }
        }

        if self.policy == StalePolicy::EvictOldestOnMismatch {
            if let Some(pos) = inner.free.iter().position(|b| b.capacity() != size) {
                if let Some(stale) = inner.free.remove(pos) {
                    trace!(
                        "Evicting stale {} byte buffer for {} byte request",
                        stale.capacity(),
                        size
                    );
                    inner.stats.evicted += 1;
                }
            }
        }

        let serial = inner.next_serial;
        inner.next_serial += 1;
        inner.stats.allocations += 1;
        FrameBuffer::allocate(size, serial)
    }

    /// Return a buffer. Dropped instead when the pool is already full.
    pub fn release(&self, mut buffer: FrameBuffer) {
        buffer.clear();

        let mut inner = self.inner.lock();
        if inner.free.len() < self.max_buffers {
            inner.free.push_back(buffer);
        } else {
            inner.stats.dropped += 1;
        }
    }

    /// Drop every pooled buffer.
    pub fn clear(&self) {
        self.inner.lock().free.clear();
    }

    /// Number of free buffers currently pooled.
    pub fn len(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats.clone()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("free", &self.len())
            .field("max_buffers", &self.max_buffers)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Pool shared between the decode worker and frame consumers.
pub type SharedBufferPool = Arc<BufferPool>;
