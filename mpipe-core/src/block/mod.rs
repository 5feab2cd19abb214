//! Blocks and the queues that carry them between pipeline stages
//!
//! A [`Block`] is a timestamped unit of payload. It is owned by exactly one
//! holder at a time: a [`BlockQueue`], or the stage currently working on it.
//! Moving a block transfers ownership; dropping it releases the payload
//! (back to its [`BlockPool`] when it came from one). Release therefore
//! happens exactly once, at the point the last owner is done with it.

pub(crate) mod cancel;
mod pool;
mod queue;

pub use cancel::CancelToken;
pub use pool::{BlockPool, PoolStats};
pub use queue::{BlockQueue, Cancelled, QueueLimits, QueueStats};

use crate::error::{Error, Result};
use mpipe_common::Mtime;
use pool::PoolShared;
use std::sync::Weak;

/// Block flag set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BlockFlags(u32);

impl BlockFlags {
    pub const NONE: BlockFlags = BlockFlags(0);
    /// Block carries container/protocol header bytes, not media payload
    pub const HEADER: BlockFlags = BlockFlags(1 << 0);
    /// Block starts an independently decodable unit
    pub const KEYFRAME: BlockFlags = BlockFlags(1 << 1);
    /// Timeline break before this block
    pub const DISCONTINUITY: BlockFlags = BlockFlags(1 << 2);
    /// Payload known to be damaged
    pub const CORRUPTED: BlockFlags = BlockFlags(1 << 3);

    pub fn contains(self, other: BlockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BlockFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BlockFlags) {
        self.0 &= !other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BlockFlags {
    type Output = BlockFlags;

    fn bitor(self, rhs: BlockFlags) -> BlockFlags {
        BlockFlags(self.0 | rhs.0)
    }
}

/// A single unit of timestamped payload
pub struct Block {
    buffer: Vec<u8>,
    pool: Option<Weak<PoolShared>>,

    /// Presentation timestamp
    pub pts: Option<Mtime>,

    /// Decode timestamp
    pub dts: Option<Mtime>,

    /// Duration of the payload, when known
    pub duration: Option<Mtime>,

    pub flags: BlockFlags,
}

impl Block {
    /// Wrap an already-allocated buffer (not pooled)
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::with_buffer(data, None)
    }

    /// Copy `data` into a new block, failing instead of aborting on allocation failure
    pub fn try_copy_from_slice(data: &[u8]) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(data.len()).map_err(|e| {
            Error::ResourceExhausted(format!("block of {} bytes: {}", data.len(), e))
        })?;
        buffer.extend_from_slice(data);
        Ok(Self::from_vec(buffer))
    }

    pub(crate) fn with_buffer(buffer: Vec<u8>, pool: Option<Weak<PoolShared>>) -> Self {
        Self {
            buffer,
            pool,
            pts: None,
            dts: None,
            duration: None,
            flags: BlockFlags::NONE,
        }
    }

    pub fn with_pts(mut self, pts: Mtime) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_duration(mut self, duration: Mtime) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_flags(mut self, flags: BlockFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    /// Logical payload length in bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Allocated capacity in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable access to the payload buffer while this holder owns the block
    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Take the payload out, detaching it from its pool
    pub fn into_vec(mut self) -> Vec<u8> {
        self.pool = None;
        std::mem::take(&mut self.buffer)
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|weak| weak.upgrade()) {
            pool.recycle(std::mem::take(&mut self.buffer));
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.buffer.len())
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .field("flags", &self.flags)
            .finish()
    }
}
