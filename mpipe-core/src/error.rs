//! Error types for mpipe-core
//!
//! Errors fall in three groups:
//! - recoverable per-unit failures (`Decode`, rejected frames) that callers log and skip
//! - rejected operations (`Rejected`, `Unsupported`) returned with no side effect
//! - fatal failures (`ResourceExhausted`, `AccessOutput`, `ClockOverflow`) that end the affected component

use crate::format::FourCC;
use crate::mux::{MuxerState, StreamId};
use thiserror::Error;

/// Main error type for mpipe-core
#[derive(Error, Debug)]
pub enum Error {
    /// Allocation failed or a queue bound was reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation refused by a muxer (no side effect)
    #[error("Rejected: {0}")]
    Rejected(RejectReason),

    /// Query or feature not supported by this component
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A single block could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Audio output refused the negotiated format
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Transport write failed
    #[error("Access output error: {0}")]
    AccessOutput(#[from] std::io::Error),

    /// Presentation clock advanced past the representable range
    #[error("Presentation clock overflow after {0}")]
    ClockOverflow(mpipe_common::Mtime),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Referenced component does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Shared-library error (configuration, I/O)
    #[error(transparent)]
    Common(#[from] mpipe_common::Error),
}

impl Error {
    /// True for errors that end the component that raised them
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted(_) | Error::AccessOutput(_) | Error::ClockOverflow(_)
        )
    }
}

/// Why a muxer refused an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The declared maximum input count would be exceeded
    TooManyInputs { max: usize },
    /// Codec outside the muxer's supported set
    UnsupportedCodec(FourCC),
    /// Muxing already started and the format cannot take new inputs
    AddWhileMuxing,
    /// No input with this id was ever added
    UnknownStream(StreamId),
    /// Operation not valid in this muxer state
    State(MuxerState),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::TooManyInputs { max } => write!(f, "only {} input(s) allowed", max),
            RejectReason::UnsupportedCodec(codec) => write!(f, "unsupported codec '{}'", codec),
            RejectReason::AddWhileMuxing => write!(f, "cannot add stream while muxing"),
            RejectReason::UnknownStream(id) => write!(f, "unknown stream {}", id),
            RejectReason::State(state) => write!(f, "muxer is {}", state),
        }
    }
}

/// Convenience Result type using mpipe-core Error
pub type Result<T> = std::result::Result<T, Error>;
