use super::AccessOutput;
use crate::block::{Block, BlockFlags};
use crate::error::Result;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Access output over any `std::io::Write` (file, stdout, socket)
pub struct WriterAccess<W: Write + Send> {
    writer: W,
    bytes_written: u64,
    writes: u64,
}

impl<W: Write + Send> WriterAccess<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            bytes_written: 0,
            writes: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> AccessOutput for WriterAccess<W> {
    fn write(&mut self, block: Block) -> Result<usize> {
        self.writer.write_all(block.data())?;
        self.bytes_written += block.len() as u64;
        self.writes += 1;
        trace!("Wrote {} bytes (total {})", block.len(), self.bytes_written);
        Ok(block.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// One recorded write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub data: Vec<u8>,
    pub flags: BlockFlags,
}

#[derive(Default)]
struct MemoryState {
    writes: Vec<RecordedWrite>,
    fail_after: Option<usize>,
    flushes: usize,
}

/// In-memory access output that records every write separately
///
/// Clones share the same record, so a test keeps one clone to inspect what
/// a muxer wrote through the other.
#[derive(Clone, Default)]
pub struct MemoryAccess {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write after the first `count` successful ones fail
    pub fn fail_after(&self, count: usize) {
        self.lock().fail_after = Some(count);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    /// All written bytes, concatenated in write order
    pub fn contents(&self) -> Vec<u8> {
        self.lock()
            .writes
            .iter()
            .flat_map(|w| w.data.iter().copied())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AccessOutput for MemoryAccess {
    fn write(&mut self, block: Block) -> Result<usize> {
        let mut state = self.lock();
        if state.fail_after.is_some_and(|n| state.writes.len() >= n) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory access closed").into());
        }

        let len = block.len();
        let flags = block.flags;
        state.writes.push(RecordedWrite {
            data: block.into_vec(),
            flags,
        });
        Ok(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().flushes += 1;
        Ok(())
    }
}

impl std::fmt::Debug for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAccess")
            .field("writes", &self.write_count())
            .finish()
    }
}
