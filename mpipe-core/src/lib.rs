//! # mpipe core
//!
//! Media pipeline building blocks: timestamped [`block::Block`]s moving
//! through FIFO [`block::BlockQueue`]s into decoder threads and muxers.
//!
//! **Data flow:**
//! ```text
//! producer -> BlockQueue -> DecoderThread -> AudioOutput
//! producer -> BlockQueue -> Muxer (MuxFormat) -> AccessOutput
//! ```
//!
//! Everything running is owned by a [`context::PipelineContext`].

pub mod block;
pub mod context;
pub mod decoder;
pub mod error;
pub mod format;
pub mod mux;
pub mod sink;

pub use error::{Error, RejectReason, Result};
