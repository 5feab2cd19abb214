use super::Block;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Shared state behind a [`BlockPool`] handle
pub(crate) struct PoolShared {
    /// Buffers available for reuse
    free: Mutex<Vec<Vec<u8>>>,
    /// Maximum number of buffers kept for reuse
    max_retained: usize,
    /// Shrink buffers to this capacity when they come back
    trim_capacity: usize,
    /// Largest block the pool hands out
    max_block_size: AtomicUsize,
    allocated: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
}

impl PoolShared {
    /// Take a returned buffer back, or drop it if the pool is full
    pub(crate) fn recycle(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        buffer.shrink_to(self.trim_capacity);
        if buffer.capacity() == 0 {
            return;
        }

        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_retained {
            free.push(buffer);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Pool of reusable block payload buffers
///
/// Blocks allocated from the pool hand their buffer back when dropped, so a
/// steady-state pipeline stops allocating once the pool is warm. Handles are
/// cheap to clone; all clones share the same free list. Blocks hold only a
/// weak reference, so dropping every pool handle simply turns pending blocks
/// into ordinary allocations.
#[derive(Clone)]
pub struct BlockPool {
    shared: Arc<PoolShared>,
}

/// Pool counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Fresh allocations made by the pool
    pub allocated: u64,
    /// Allocations served from the free list
    pub reused: u64,
    /// Buffers returned to the free list
    pub recycled: u64,
    /// Buffers currently waiting in the free list
    pub retained: usize,
}

impl BlockPool {
    /// Create a pool
    ///
    /// # Arguments
    /// * `max_retained` - Maximum buffers kept for reuse
    /// * `trim_capacity` - Returned buffers are shrunk to this capacity
    pub fn new(max_retained: usize, trim_capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::with_capacity(max_retained.min(16))),
                max_retained,
                trim_capacity,
                max_block_size: AtomicUsize::new(usize::MAX),
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    /// Refuse allocations larger than `max` bytes
    ///
    /// Applies to every clone of this pool.
    pub fn with_max_block_size(self, max: usize) -> Self {
        self.shared.max_block_size.store(max, Ordering::Relaxed);
        self
    }

    /// Allocate an empty block with at least `capacity` bytes reserved
    ///
    /// Returns `ResourceExhausted` instead of aborting when memory is short
    /// or `capacity` exceeds the pool's block size limit.
    pub fn alloc(&self, capacity: usize) -> Result<Block> {
        let max = self.shared.max_block_size.load(Ordering::Relaxed);
        if capacity > max {
            return Err(Error::ResourceExhausted(format!(
                "block of {} bytes exceeds pool limit of {}",
                capacity, max
            )));
        }

        let reused = {
            let mut free = self.shared.free.lock().unwrap_or_else(PoisonError::into_inner);
            free.pop()
        };

        let buffer = match reused {
            Some(mut buffer) => {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                buffer.try_reserve_exact(capacity).map_err(|e| {
                    Error::ResourceExhausted(format!("block of {} bytes: {}", capacity, e))
                })?;
                buffer
            }
            None => {
                let mut buffer = Vec::new();
                buffer.try_reserve_exact(capacity).map_err(|e| {
                    Error::ResourceExhausted(format!("block of {} bytes: {}", capacity, e))
                })?;
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                buffer
            }
        };

        trace!("Pool alloc: requested={} capacity={}", capacity, buffer.capacity());
        Ok(Block::with_buffer(buffer, Some(Arc::downgrade(&self.shared))))
    }

    /// Allocate a block holding a copy of `data`
    pub fn alloc_from(&self, data: &[u8]) -> Result<Block> {
        let mut block = self.alloc(data.len())?;
        block.buffer_mut().extend_from_slice(data);
        Ok(block)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            recycled: self.shared.recycled.load(Ordering::Relaxed),
            retained: self
                .shared
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(64, 256 * 1024)
    }
}
