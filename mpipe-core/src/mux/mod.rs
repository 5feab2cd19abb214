//! Muxing stage: per-stream block queues in, framed bytes out
//!
//! A [`Muxer`] hosts one [`MuxFormat`] (the framing rules) plus the set of
//! registered input streams and the [`AccessOutput`](crate::sink::AccessOutput)
//! the framed bytes go to. The host owns the state machine, capacity checks
//! and the non-blocking drain; formats only decide what bytes one block
//! becomes.

mod control;
mod mpjpeg;
mod muxer;
mod raw;

pub use control::{MuxQuery, MuxReply};
pub use mpjpeg::{MpjpegFormat, BOUNDARY, CONTENT_TYPE, SUPPORTED_CODECS};
pub use muxer::{InputHandle, Muxer};
pub use raw::RawFormat;

use crate::block::Block;
use crate::error::{Error, RejectReason, Result};
use crate::format::EsFormat;
use crate::sink::AccessOutput;
use serde::{Deserialize, Serialize};

/// Identifier of an input stream within one muxer
///
/// Assigned in `add_stream` order and never reused by that muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Muxer lifecycle
///
/// ```text
/// Closed --open--> Open --first mux()--> Active --close--> Finished
///                    |                                        ^
///                    +------------------close-----------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuxerState {
    Closed,
    Open,
    Active,
    Finished,
}

impl std::fmt::Display for MuxerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MuxerState::Closed => write!(f, "closed"),
            MuxerState::Open => write!(f, "open"),
            MuxerState::Active => write!(f, "active"),
            MuxerState::Finished => write!(f, "finished"),
        }
    }
}

/// Capability flags a format declares to its host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxCapabilities {
    /// Streams may still be added after the first `mux()`
    pub add_while_muxing: bool,
    /// `mux()` writes nothing until every active input has a block queued
    pub wait_for_first_block: bool,
    /// Maximum simultaneously active inputs; `None` is unbounded
    pub max_inputs: Option<usize>,
}

/// Framing rules for one output format
pub trait MuxFormat: Send {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> MuxCapabilities;

    /// Content descriptor advertised to the transport, if any
    fn mime(&self) -> Option<String> {
        None
    }

    /// Answer a control query
    ///
    /// The default covers the closed query set from the capability flags
    /// and [`mime`](Self::mime); anything else is `Unsupported`.
    fn control(&self, query: &MuxQuery) -> Result<MuxReply> {
        let caps = self.capabilities();
        match query {
            MuxQuery::CanAddStreamWhileMuxing => Ok(MuxReply::Bool(caps.add_while_muxing)),
            MuxQuery::AddStreamWait => Ok(MuxReply::Bool(caps.wait_for_first_block)),
            MuxQuery::Mime => self
                .mime()
                .map(MuxReply::Mime)
                .ok_or_else(|| Error::Unsupported(format!("{}: no mime type", self.name()))),
            MuxQuery::Named(name) => Err(Error::Unsupported(format!(
                "{}: unknown query '{}'",
                self.name(),
                name
            ))),
        }
    }

    /// Check whether a stream with `format` can be muxed
    fn accepts(&self, format: &EsFormat) -> std::result::Result<(), RejectReason>;

    /// Frame one block and write it to `access`
    ///
    /// Returning an error fails the current `mux()` call.
    fn write_block(
        &mut self,
        stream: StreamId,
        block: Block,
        access: &mut dyn AccessOutput,
    ) -> Result<()>;

    /// Write any trailer when the muxer closes
    fn close(&mut self, _access: &mut dyn AccessOutput) -> Result<()> {
        Ok(())
    }
}
