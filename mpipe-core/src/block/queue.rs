use super::cancel::{CancelToken, Waiter};
use super::Block;
use crate::error::{Error, Result};
use mpipe_common::Mtime;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tracing::{trace, warn};

/// Returned by blocking waits when their cancel token fires
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("wait cancelled")]
pub struct Cancelled;

/// Optional bounds on pending queue contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLimits {
    /// Maximum pending blocks
    pub max_blocks: Option<usize>,
    /// Maximum pending payload bytes
    pub max_bytes: Option<usize>,
}

impl QueueLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }
}

impl From<mpipe_common::config::QueueConfig> for QueueLimits {
    fn from(config: mpipe_common::config::QueueConfig) -> Self {
        Self {
            max_blocks: config.max_blocks,
            max_bytes: config.max_bytes,
        }
    }
}

struct QueueState {
    blocks: VecDeque<Block>,
    /// Sum of pending payload lengths
    bytes: usize,
    /// Timestamp of the most recently pushed block that had one
    last_pts: Option<Mtime>,
    pushed: u64,
    popped: u64,
}

struct QueueShared {
    state: Mutex<QueueState>,
    /// Signalled when a block is pushed
    available: Condvar,
    /// Signalled when the queue becomes empty
    drained: Condvar,
    limits: QueueLimits,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Waiter for QueueShared {
    fn wake_all(&self) {
        let _state = self.lock();
        self.available.notify_all();
        self.drained.notify_all();
    }
}

/// Queue counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub bytes: usize,
    pub pushed: u64,
    pub popped: u64,
}

/// Thread-safe FIFO of blocks between a producer and a consumer stage
///
/// Push order is pop order. The queue owns every pending block; a pop moves
/// the oldest block out to the caller, so no reference to it remains here.
///
/// `BlockQueue` is a handle: clones address the same queue, which lets the
/// producer and consumer each hold one without sharing a lifetime.
#[derive(Clone)]
pub struct BlockQueue {
    shared: Arc<QueueShared>,
}

impl BlockQueue {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::with_limits(QueueLimits::unbounded())
    }

    pub fn with_limits(limits: QueueLimits) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    blocks: VecDeque::new(),
                    bytes: 0,
                    last_pts: None,
                    pushed: 0,
                    popped: 0,
                }),
                available: Condvar::new(),
                drained: Condvar::new(),
                limits,
            }),
        }
    }

    /// Append a block at the tail, taking ownership of it
    ///
    /// Fails with `ResourceExhausted` when the queue cannot grow or a
    /// configured limit would be exceeded; the block is released in that case.
    /// A block larger than `max_bytes` is still accepted into an empty queue
    /// so that it can make progress at all.
    pub fn push(&self, block: Block) -> Result<()> {
        let mut state = self.shared.lock();

        if let Some(max) = self.shared.limits.max_blocks {
            if state.blocks.len() >= max {
                return Err(Error::ResourceExhausted(format!(
                    "queue full: {} blocks pending (max {})",
                    state.blocks.len(),
                    max
                )));
            }
        }
        if let Some(max) = self.shared.limits.max_bytes {
            if !state.blocks.is_empty() && state.bytes + block.len() > max {
                return Err(Error::ResourceExhausted(format!(
                    "queue full: {} + {} bytes exceeds {}",
                    state.bytes,
                    block.len(),
                    max
                )));
            }
        }

        state
            .blocks
            .try_reserve(1)
            .map_err(|e| Error::ResourceExhausted(format!("queue slot: {}", e)))?;

        if let Some(pts) = block.pts {
            if let Some(last) = state.last_pts {
                if pts < last {
                    warn!("Block pushed out of timestamp order: pts={} after {}", pts, last);
                }
            }
            state.last_pts = Some(pts);
        }

        state.bytes += block.len();
        state.pushed += 1;
        state.blocks.push_back(block);
        trace!("Queue push: pending={} bytes={}", state.blocks.len(), state.bytes);
        drop(state);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Remove the oldest block without waiting
    ///
    /// Returns `None` immediately when the queue is empty.
    pub fn try_pop(&self) -> Option<Block> {
        let mut state = self.shared.lock();
        self.pop_locked(&mut state)
    }

    /// Remove the oldest block, waiting until one is pushed or `cancel` fires
    ///
    /// Cancellation wins over pending data: once the token is cancelled this
    /// returns `Cancelled` even if blocks are queued, so a stopping consumer
    /// never dequeues further input.
    pub fn pop(&self, cancel: &CancelToken) -> std::result::Result<Block, Cancelled> {
        let shared: Arc<dyn Waiter> = self.shared.clone();
        let weak: Weak<dyn Waiter> = Arc::downgrade(&shared);
        cancel.register(weak);

        let mut state = self.shared.lock();
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if let Some(block) = self.pop_locked(&mut state) {
                return Ok(block);
            }
            state = self
                .shared
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn pop_locked(&self, state: &mut QueueState) -> Option<Block> {
        let block = state.blocks.pop_front()?;
        state.bytes -= block.len();
        state.popped += 1;
        if state.blocks.is_empty() {
            self.shared.drained.notify_all();
        }
        Some(block)
    }

    /// Wait until every pending block has been popped, or `cancel` fires
    pub fn wait_empty(&self, cancel: &CancelToken) -> std::result::Result<(), Cancelled> {
        let shared: Arc<dyn Waiter> = self.shared.clone();
        let weak: Weak<dyn Waiter> = Arc::downgrade(&shared);
        cancel.register(weak);

        let mut state = self.shared.lock();
        loop {
            if state.blocks.is_empty() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            state = self
                .shared
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of pending blocks
    pub fn count(&self) -> usize {
        self.shared.lock().blocks.len()
    }

    /// Pending payload volume in bytes
    pub fn bytes(&self) -> usize {
        self.shared.lock().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn limits(&self) -> QueueLimits {
        self.shared.limits
    }

    /// Media time covered by the pending blocks
    ///
    /// Measured between the earliest and latest timestamp (pts, else dts).
    /// `None` until at least one pending block is dated.
    pub fn pending_span(&self) -> Option<Mtime> {
        let state = self.shared.lock();
        let mut dated = state.blocks.iter().filter_map(|b| b.pts.or(b.dts));
        let first = dated.next()?;
        let (low, high) = dated.fold((first, first), |(low, high), t| (low.min(t), high.max(t)));
        Some(high.saturating_sub(low))
    }

    /// True when a block-count or byte bound has been reached
    pub fn is_full(&self) -> bool {
        let state = self.shared.lock();
        let limits = self.shared.limits;
        limits.max_blocks.is_some_and(|max| state.blocks.len() >= max)
            || limits.max_bytes.is_some_and(|max| state.bytes >= max)
    }

    /// Release every pending block, returning how many were dropped
    pub fn clear(&self) -> usize {
        let discarded = {
            let mut state = self.shared.lock();
            state.bytes = 0;
            let discarded = std::mem::take(&mut state.blocks);
            self.shared.drained.notify_all();
            discarded
        };
        // Blocks are released outside the queue lock
        discarded.len()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock();
        QueueStats {
            pending: state.blocks.len(),
            bytes: state.bytes,
            pushed: state.pushed,
            popped: state.popped,
        }
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BlockQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("BlockQueue")
            .field("pending", &stats.pending)
            .field("bytes", &stats.bytes)
            .field("limits", &self.shared.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn block(tag: u8) -> Block {
        Block::from_vec(vec![tag; 4])
    }

    #[test]
    fn test_fifo_order() {
        let queue = BlockQueue::new();
        for tag in 0..10u8 {
            queue.push(block(tag)).unwrap();
        }

        for tag in 0..10u8 {
            assert_eq!(queue.try_pop().unwrap().data()[0], tag);
        }
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_count_and_bytes_track_pops() {
        let queue = BlockQueue::new();
        queue.push(block(1)).unwrap();
        queue.push(Block::from_vec(vec![0; 10])).unwrap();
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.bytes(), 14);

        let popped = queue.try_pop().unwrap();
        assert_eq!(popped.len(), 4);
        assert_eq!(queue.count(), 1);
        assert_eq!(queue.bytes(), 10);
    }

    #[test]
    fn test_pending_span() {
        let queue = BlockQueue::new();
        queue.push(block(0)).unwrap();
        assert_eq!(queue.pending_span(), None);

        queue.push(block(1).with_pts(40_000)).unwrap();
        assert_eq!(queue.pending_span(), Some(0));

        queue.push(block(2)).unwrap();
        queue.push(block(3).with_pts(120_000)).unwrap();
        assert_eq!(queue.pending_span(), Some(80_000));

        queue.clear();
        assert_eq!(queue.pending_span(), None);
    }

    #[test]
    fn test_is_full() {
        let unbounded = BlockQueue::new();
        unbounded.push(block(0)).unwrap();
        assert!(!unbounded.is_full());

        let queue = BlockQueue::with_limits(QueueLimits {
            max_blocks: Some(2),
            max_bytes: None,
        });
        queue.push(block(0)).unwrap();
        assert!(!queue.is_full());
        queue.push(block(1)).unwrap();
        assert!(queue.is_full());
    }

    #[test]
    fn test_max_blocks_limit() {
        let queue = BlockQueue::with_limits(QueueLimits {
            max_blocks: Some(2),
            max_bytes: None,
        });
        queue.push(block(1)).unwrap();
        queue.push(block(2)).unwrap();

        let err = queue.push(block(3)).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(queue.count(), 2);
    }

    #[test]
    fn test_max_bytes_limit_admits_oversized_into_empty_queue() {
        let queue = BlockQueue::with_limits(QueueLimits {
            max_blocks: None,
            max_bytes: Some(8),
        });
        queue.push(Block::from_vec(vec![0; 16])).unwrap();
        assert!(queue.push(block(1)).is_err());

        queue.try_pop().unwrap();
        queue.push(block(1)).unwrap();
        queue.push(block(2)).unwrap();
        assert!(queue.push(block(3)).is_err());
    }

    #[test]
    fn test_blocking_pop_wakes_on_push() {
        let queue = BlockQueue::new();
        let cancel = CancelToken::new();

        let consumer = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            thread::spawn(move || queue.pop(&cancel))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(block(7)).unwrap();

        let popped = consumer.join().unwrap().unwrap();
        assert_eq!(popped.data()[0], 7);
    }

    #[test]
    fn test_blocking_pop_cancelled() {
        let queue = BlockQueue::new();
        let cancel = CancelToken::new();

        let consumer = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            thread::spawn(move || queue.pop(&cancel))
        };

        thread::sleep(Duration::from_millis(20));
        cancel.cancel();

        assert_eq!(consumer.join().unwrap().unwrap_err(), Cancelled);
    }

    #[test]
    fn test_cancel_wins_over_pending_data() {
        let queue = BlockQueue::new();
        queue.push(block(1)).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();

        assert_eq!(queue.pop(&cancel).unwrap_err(), Cancelled);
        assert_eq!(queue.count(), 1);
    }

    #[test]
    fn test_wait_empty_returns_after_drain() {
        let queue = BlockQueue::new();
        for tag in 0..3 {
            queue.push(block(tag)).unwrap();
        }

        let drainer = {
            let queue = queue.clone();
            thread::spawn(move || {
                while queue.try_pop().is_some() {
                    thread::sleep(Duration::from_millis(5));
                }
            })
        };

        queue.wait_empty(&CancelToken::new()).unwrap();
        assert!(queue.is_empty());
        drainer.join().unwrap();
    }

    #[test]
    fn test_clear_releases_pooled_blocks() {
        let pool = crate::block::BlockPool::new(8, 1024);
        let queue = BlockQueue::new();
        for _ in 0..3 {
            queue.push(pool.alloc_from(b"xyz").unwrap()).unwrap();
        }

        assert_eq!(queue.clear(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.bytes(), 0);
        assert_eq!(pool.stats().retained, 3);
    }

    #[test]
    fn test_out_of_order_pts_is_accepted() {
        let queue = BlockQueue::new();
        queue.push(block(1).with_pts(2_000)).unwrap();
        queue.push(block(2).with_pts(1_000)).unwrap();
        assert_eq!(queue.count(), 2);
    }
}
