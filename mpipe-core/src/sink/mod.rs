//! Output contracts for the pipeline
//!
//! - [`AudioOutput`]: receives decoded, timestamped frames from a decoder thread
//! - [`AccessOutput`]: receives framed bytes from a muxer for transport
//!
//! Both are traits so real devices and transports plug in from outside the core.

mod access;
mod ring_buffer;

pub use access::{MemoryAccess, RecordedWrite, WriterAccess};
pub use ring_buffer::{AudioConsumer, RingBufferOutput, RingBufferStats};

use crate::block::Block;
use crate::decoder::DecodedFrame;
use crate::error::Result;
use crate::format::AudioFormat;
use mpipe_common::Mtime;
use thiserror::Error;

/// An audio output declined one frame
///
/// Recoverable: the decoder counts it and moves on to the next frame.
#[derive(Debug, Error)]
#[error("frame rejected: {reason}")]
pub struct FrameRejected {
    pub reason: String,
}

impl FrameRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Destination for decoded audio
pub trait AudioOutput: Send {
    /// Agree on the output format before the first frame
    fn negotiate(&mut self, format: &AudioFormat) -> Result<()>;

    /// Take ownership of one frame presented at `pts`
    fn play(&mut self, frame: DecodedFrame, pts: Mtime) -> std::result::Result<(), FrameRejected>;

    /// Called once when the owning decoder is torn down
    fn release(&mut self) {}
}

/// Destination for muxed bytes
pub trait AccessOutput: Send {
    /// Take ownership of `block` and transmit it; returns the bytes written
    ///
    /// Failures are fatal for the muxing session that issued the write.
    fn write(&mut self, block: Block) -> Result<usize>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
