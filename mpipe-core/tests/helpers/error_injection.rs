//! Decoder with scripted per-block failures
//!
//! The first payload byte picks the outcome:
//! - `FAIL_DECODE`: recoverable decode error, block is skipped
//! - `FAIL_FATAL`: resource exhaustion, decoder thread terminates
//! - anything else: one frame with one sample frame per payload byte

use mpipe_core::block::Block;
use mpipe_core::decoder::{DecodedFrame, Decoder};
use mpipe_core::format::{AudioFormat, EsFormat};
use mpipe_core::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const FAIL_DECODE: u8 = 0xFD;
pub const FAIL_FATAL: u8 = 0xFE;

#[derive(Clone, Default)]
pub struct ScriptedDecoder {
    closes: Arc<AtomicU32>,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Decoder for ScriptedDecoder {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open(&mut self, format: &EsFormat) -> Result<AudioFormat> {
        let audio = format
            .audio
            .ok_or_else(|| Error::Unsupported("no audio params".to_string()))?;
        Ok(AudioFormat {
            rate: audio.rate,
            channels: 1,
        })
    }

    fn decode(&mut self, block: &Block) -> Result<Vec<DecodedFrame>> {
        match block.data().first() {
            Some(&FAIL_DECODE) => Err(Error::Decode("scripted decode failure".to_string())),
            Some(&FAIL_FATAL) => Err(Error::ResourceExhausted("scripted exhaustion".to_string())),
            _ => Ok(vec![DecodedFrame::new(vec![0.0; block.len()], 1)]),
        }
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
