//! Decoding stage: compressed blocks in, timestamped frames out
//!
//! A [`DecoderThread`] owns one [`Decoder`] implementation, pops blocks from
//! its input [`BlockQueue`](crate::block::BlockQueue), stamps every decoded
//! frame from its [`PresentationClock`] and hands the result to an
//! [`AudioOutput`](crate::sink::AudioOutput).
//!
//! The codec itself sits behind the [`Decoder`] trait; [`PcmDecoder`] is the
//! built-in raw PCM implementation.

mod clock;
mod pcm;
mod thread;

pub use clock::PresentationClock;
pub use mpipe_common::events::DecoderState;
pub use pcm::PcmDecoder;
pub use thread::{DecoderHandle, DecoderReport, DecoderThread};

use crate::block::Block;
use crate::error::Result;
use crate::format::{AudioFormat, EsFormat};

/// Codec seam used by [`DecoderThread`]
///
/// Error contract for [`Decoder::decode`]:
/// - `Error::Decode` means this one block is bad; the thread skips it and continues
/// - `Error::ResourceExhausted` means decoder state could not be allocated; the thread terminates
pub trait Decoder: Send {
    /// Codec name for logging
    fn name(&self) -> &'static str;

    /// Prepare decoder state for `format` and return the output format
    ///
    /// Fails with `Unsupported` when the codec or its parameters are not handled.
    fn open(&mut self, format: &EsFormat) -> Result<AudioFormat>;

    /// Decode one block into zero or more frames
    fn decode(&mut self, block: &Block) -> Result<Vec<DecodedFrame>>;

    /// Release decoder state
    fn close(&mut self) {}
}

/// One decoded audio buffer (interleaved f32 samples)
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Interleaved samples, `frames * channels` long
    pub samples: Vec<f32>,

    /// Sample frames per channel
    pub frames: u32,

    pub channels: u16,
}

impl DecodedFrame {
    pub fn new(samples: Vec<f32>, channels: u16) -> Self {
        let frames = if channels == 0 {
            0
        } else {
            (samples.len() / channels as usize) as u32
        };
        Self {
            samples,
            frames,
            channels,
        }
    }
}
