//! Event types for the pipeline event bus

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a decoder thread
///
/// `Terminated` is absorbing: no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderState {
    Uninitialized,
    Running,
    Draining,
    Terminated,
}

impl DecoderState {
    /// Check whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: DecoderState) -> bool {
        use DecoderState::*;
        matches!(
            (self, next),
            (Uninitialized, Running)
                | (Uninitialized, Terminated)
                | (Running, Draining)
                | (Running, Terminated)
                | (Draining, Terminated)
        )
    }
}

impl std::fmt::Display for DecoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecoderState::Uninitialized => write!(f, "uninitialized"),
            DecoderState::Running => write!(f, "running"),
            DecoderState::Draining => write!(f, "draining"),
            DecoderState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Pipeline event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// Decoder thread changed lifecycle state
    DecoderStateChanged {
        decoder_id: Uuid,
        state: DecoderState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Decoder thread hit a fatal error and terminated
    DecoderFailed {
        decoder_id: Uuid,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Input stream registered on a muxer
    StreamAdded {
        muxer_id: Uuid,
        stream_id: u32,
        codec: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Input stream marked inactive on a muxer
    StreamRemoved {
        muxer_id: Uuid,
        stream_id: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Access output rejected a write during mux
    MuxWriteFailed {
        muxer_id: Uuid,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PipelineEvent {
    /// Event type name as it appears in the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::DecoderStateChanged { .. } => "DecoderStateChanged",
            PipelineEvent::DecoderFailed { .. } => "DecoderFailed",
            PipelineEvent::StreamAdded { .. } => "StreamAdded",
            PipelineEvent::StreamRemoved { .. } => "StreamRemoved",
            PipelineEvent::MuxWriteFailed { .. } => "MuxWriteFailed",
        }
    }
}
