//! Recording audio output for decoder tests

use mpipe_common::Mtime;
use mpipe_core::decoder::DecodedFrame;
use mpipe_core::format::AudioFormat;
use mpipe_core::sink::{AudioOutput, FrameRejected};
use mpipe_core::{Error, Result};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CaptureState {
    format: Option<AudioFormat>,
    frames: Vec<(u32, Mtime)>,
    releases: u32,
    reject_all: bool,
    refuse_format: bool,
}

/// Audio output that keeps every frame it is handed
///
/// Clones share state: keep one clone, give the other to the decoder.
#[derive(Clone, Default)]
pub struct AudioCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl AudioCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every frame passed to `play`
    pub fn rejecting() -> Self {
        let capture = Self::new();
        capture.state.lock().unwrap().reject_all = true;
        capture
    }

    /// Fail format negotiation
    pub fn refusing_format() -> Self {
        let capture = Self::new();
        capture.state.lock().unwrap().refuse_format = true;
        capture
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.state.lock().unwrap().format
    }

    /// (sample frames, pts) of every accepted frame, in play order
    pub fn frames(&self) -> Vec<(u32, Mtime)> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn timestamps(&self) -> Vec<Mtime> {
        self.frames().into_iter().map(|(_, pts)| pts).collect()
    }

    pub fn releases(&self) -> u32 {
        self.state.lock().unwrap().releases
    }
}

impl AudioOutput for AudioCapture {
    fn negotiate(&mut self, format: &AudioFormat) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_format {
            return Err(Error::AudioOutput("format refused".to_string()));
        }
        state.format = Some(*format);
        Ok(())
    }

    fn play(&mut self, frame: DecodedFrame, pts: Mtime) -> std::result::Result<(), FrameRejected> {
        let mut state = self.state.lock().unwrap();
        if state.reject_all {
            return Err(FrameRejected::new("capture rejecting"));
        }
        state.frames.push((frame.frames, pts));
        Ok(())
    }

    fn release(&mut self) {
        self.state.lock().unwrap().releases += 1;
    }
}
