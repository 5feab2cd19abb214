//! Test helpers for mpipe-core integration tests
//!
//! - AudioCapture: audio output that records every frame and timestamp
//! - ScriptedDecoder: decoder whose per-block outcome is chosen by the payload

#![allow(dead_code)]

pub mod audio_capture;
pub mod error_injection;

pub use audio_capture::AudioCapture;
pub use error_injection::{ScriptedDecoder, FAIL_DECODE, FAIL_FATAL};

use mpipe_core::block::Block;
use mpipe_core::format::{EsFormat, FourCC};

/// Mono s16 PCM at 1kHz: one sample frame is exactly 1ms
pub fn pcm_format() -> EsFormat {
    EsFormat::audio(FourCC::new(b"s16l"), 1_000, 1)
}

/// Silent mono s16 block of `frames` sample frames
pub fn pcm_block(frames: usize) -> Block {
    Block::from_vec(vec![0; frames * 2])
}
