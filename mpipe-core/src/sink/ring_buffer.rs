//! Lock-free sample ring between a decoder thread and an audio device callback
//!
//! The decoder side ([`RingBufferOutput`]) pushes whole frames or nothing:
//! a frame that does not fit is rejected and counted as an overrun. The
//! device side ([`AudioConsumer`]) pulls interleaved samples and counts an
//! underrun whenever it asks for more than is buffered.

use super::{AudioOutput, FrameRejected};
use crate::decoder::DecodedFrame;
use crate::error::{Error, Result};
use crate::format::AudioFormat;
use mpipe_common::Mtime;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, warn};

/// Default capacity in samples (~93ms of stereo @ 44.1kHz)
const DEFAULT_CAPACITY: usize = 8192;

struct RingShared {
    underruns: AtomicU64,
    overruns: AtomicU64,
    frames_played: AtomicU64,
    last_pts: AtomicI64,
    has_pts: AtomicBool,
    released: AtomicBool,
    format: Mutex<Option<AudioFormat>>,
}

/// Ring buffer statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBufferStats {
    pub underruns: u64,
    pub overruns: u64,
    pub frames_played: u64,
    pub capacity: usize,
    pub occupied: usize,
    pub last_pts: Option<Mtime>,
}

/// Audio output backed by a `HeapRb<f32>` producer
pub struct RingBufferOutput {
    producer: ringbuf::HeapProd<f32>,
    shared: Arc<RingShared>,
}

impl RingBufferOutput {
    /// Create the output and the consumer half for the device callback
    ///
    /// `capacity` is in samples (all channels), default 8192.
    pub fn new(capacity: Option<usize>) -> (RingBufferOutput, AudioConsumer) {
        let capacity = capacity.unwrap_or(DEFAULT_CAPACITY).max(1);
        debug!("Creating audio ring buffer with capacity: {} samples", capacity);

        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
        let shared = Arc::new(RingShared {
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
            last_pts: AtomicI64::new(0),
            has_pts: AtomicBool::new(false),
            released: AtomicBool::new(false),
            format: Mutex::new(None),
        });

        (
            RingBufferOutput {
                producer,
                shared: Arc::clone(&shared),
            },
            AudioConsumer { consumer, shared },
        )
    }

    pub fn stats(&self) -> RingBufferStats {
        stats(&self.shared, self.producer.capacity().into(), self.producer.occupied_len())
    }
}

impl AudioOutput for RingBufferOutput {
    fn negotiate(&mut self, format: &AudioFormat) -> Result<()> {
        if format.channels == 0 || format.rate == 0 {
            return Err(Error::AudioOutput(format!(
                "cannot play rate={} channels={}",
                format.rate, format.channels
            )));
        }
        if format.channels as usize > self.producer.capacity().get() {
            return Err(Error::AudioOutput(format!(
                "{} channels exceed ring capacity",
                format.channels
            )));
        }

        *self
            .shared
            .format
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(*format);
        Ok(())
    }

    fn play(&mut self, frame: DecodedFrame, pts: Mtime) -> std::result::Result<(), FrameRejected> {
        if self.producer.vacant_len() < frame.samples.len() {
            let count = self.shared.overruns.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 1000 == 1 {
                warn!("Audio ring buffer overrun (total: {})", count);
            }
            return Err(FrameRejected::new(format!(
                "ring full: {} samples, {} vacant",
                frame.samples.len(),
                self.producer.vacant_len()
            )));
        }

        self.producer.push_slice(&frame.samples);
        self.shared
            .frames_played
            .fetch_add(frame.frames as u64, Ordering::Relaxed);
        self.shared.last_pts.store(pts, Ordering::Relaxed);
        self.shared.has_pts.store(true, Ordering::Release);
        Ok(())
    }

    fn release(&mut self) {
        trace!("Audio ring buffer producer released");
        self.shared.released.store(true, Ordering::Release);
    }
}

/// Device-side half of the ring
pub struct AudioConsumer {
    consumer: ringbuf::HeapCons<f32>,
    shared: Arc<RingShared>,
}

impl AudioConsumer {
    /// Fill `out` with buffered samples; returns how many were written
    ///
    /// A short read counts as an underrun unless the producer was released.
    pub fn pop_slice(&mut self, out: &mut [f32]) -> usize {
        let read = self.consumer.pop_slice(out);
        if read < out.len() && !self.shared.released.load(Ordering::Acquire) {
            let count = self.shared.underruns.fetch_add(1, Ordering::Relaxed) + 1;
            trace!("Audio ring buffer underrun (total: {})", count);
        }
        read
    }

    /// Format agreed with the decoder, once negotiated
    pub fn format(&self) -> Option<AudioFormat> {
        *self
            .shared
            .format
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn occupied_len(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// True once the producer is released and every sample has been read
    pub fn is_finished(&self) -> bool {
        self.shared.released.load(Ordering::Acquire) && self.consumer.is_empty()
    }

    pub fn stats(&self) -> RingBufferStats {
        stats(&self.shared, self.consumer.capacity().into(), self.consumer.occupied_len())
    }
}

fn stats(shared: &RingShared, capacity: usize, occupied: usize) -> RingBufferStats {
    RingBufferStats {
        underruns: shared.underruns.load(Ordering::Relaxed),
        overruns: shared.overruns.load(Ordering::Relaxed),
        frames_played: shared.frames_played.load(Ordering::Relaxed),
        capacity,
        occupied,
        last_pts: shared
            .has_pts
            .load(Ordering::Acquire)
            .then(|| shared.last_pts.load(Ordering::Relaxed)),
    }
}
