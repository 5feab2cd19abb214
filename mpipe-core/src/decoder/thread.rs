//! Decoder thread lifecycle
//!
//! ```text
//! Uninitialized --init--> Running --stop--> Draining --> Terminated
//!        |                   |
//!        +--init failed------+--fatal error------------> Terminated
//! ```
//!
//! State is only changed by the decoder's own thread, with one exception:
//! a stop request from the owner moves `Running` to `Draining`. `Terminated`
//! is published through a condition variable so the owner can block until
//! the decoder has quiesced instead of polling.

use super::{Decoder, DecoderState, PresentationClock};
use crate::block::cancel::Waiter;
use crate::block::{Block, BlockFlags, BlockQueue, CancelToken};
use crate::error::{Error, Result};
use crate::format::{AudioFormat, EsFormat};
use crate::sink::AudioOutput;
use mpipe_common::events::PipelineEvent;
use mpipe_common::Mtime;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Counters collected over one decoder thread's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderReport {
    pub decoder_id: Uuid,
    /// Blocks decoded (including ones that produced no frames)
    pub blocks_decoded: u64,
    /// Blocks dropped: undecodable, or arrived before any timestamp was known
    pub blocks_skipped: u64,
    /// Frames accepted by the audio output
    pub frames_emitted: u64,
    /// Frames the audio output refused
    pub frames_rejected: u64,
    /// Timestamp given to the last frame handed to the output
    pub last_pts: Option<Mtime>,
    /// Set when the thread ended on a fatal error
    pub fatal: Option<String>,
}

/// Lifecycle state shared between the decoder thread and its handle
struct DecoderStatus {
    id: Uuid,
    state: Mutex<DecoderState>,
    changed: Condvar,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl DecoderStatus {
    fn new(id: Uuid, events: Option<broadcast::Sender<PipelineEvent>>) -> Self {
        Self {
            id,
            state: Mutex::new(DecoderState::Uninitialized),
            changed: Condvar::new(),
            events,
        }
    }

    fn get(&self) -> DecoderState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `next` if legal from the current state; returns whether it was applied
    fn transition(&self, next: DecoderState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition_to(next) {
            return false;
        }
        debug!("Decoder {}: {} -> {}", self.id, *state, next);
        *state = next;

        // Published under the lock so subscribers see transitions in order
        self.publish(PipelineEvent::DecoderStateChanged {
            decoder_id: self.id,
            state: next,
            timestamp: chrono::Utc::now(),
        });
        self.changed.notify_all();
        true
    }

    fn wait_terminated(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while *state != DecoderState::Terminated {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }
}

/// Pause gate checked by the decode loop between blocks
struct PauseGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            resumed: Condvar::new(),
        }
    }

    fn set(&self, paused: bool) {
        let mut guard = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = paused;
        self.resumed.notify_all();
    }

    fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block while paused; returns early on cancel
    fn wait_while_paused(&self, cancel: &CancelToken) {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        while *paused && !cancel.is_cancelled() {
            paused = self
                .resumed
                .wait(paused)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Waiter for PauseGate {
    fn wake_all(&self) {
        let _guard = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        self.resumed.notify_all();
    }
}

/// Forces `Terminated` when the decoder thread exits, even by panic
struct TerminateOnExit(Arc<DecoderStatus>);

impl Drop for TerminateOnExit {
    fn drop(&mut self) {
        self.0.transition(DecoderState::Terminated);
    }
}

/// One decoder instance bound to an input queue and an audio output
///
/// Drive it directly with [`init`](Self::init), [`run`](Self::run) and
/// [`end`](Self::end), or hand it to [`spawn`](Self::spawn) which does the
/// same on a dedicated thread and returns a [`DecoderHandle`].
pub struct DecoderThread {
    id: Uuid,
    input: BlockQueue,
    decoder: Box<dyn Decoder>,
    sink: Option<Box<dyn AudioOutput>>,
    output_format: Option<AudioFormat>,
    clock: Option<PresentationClock>,
    cancel: CancelToken,
    gate: Arc<PauseGate>,
    status: Arc<DecoderStatus>,
    report: DecoderReport,
    released: bool,
}

impl DecoderThread {
    pub fn new(input: BlockQueue, decoder: Box<dyn Decoder>, sink: Box<dyn AudioOutput>) -> Self {
        Self::build(input, decoder, sink, None)
    }

    /// Same as [`new`](Self::new), publishing lifecycle events on `events`
    pub fn with_events(
        input: BlockQueue,
        decoder: Box<dyn Decoder>,
        sink: Box<dyn AudioOutput>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self::build(input, decoder, sink, Some(events))
    }

    fn build(
        input: BlockQueue,
        decoder: Box<dyn Decoder>,
        sink: Box<dyn AudioOutput>,
        events: Option<broadcast::Sender<PipelineEvent>>,
    ) -> Self {
        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let gate = Arc::new(PauseGate::new());
        let gate_waiter: Arc<dyn Waiter> = gate.clone();
        cancel.register(Arc::downgrade(&gate_waiter));

        Self {
            id,
            input,
            decoder,
            sink: Some(sink),
            output_format: None,
            clock: None,
            cancel,
            gate,
            status: Arc::new(DecoderStatus::new(id, events)),
            report: DecoderReport {
                decoder_id: id,
                ..DecoderReport::default()
            },
            released: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> DecoderState {
        self.status.get()
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn output_format(&self) -> Option<AudioFormat> {
        self.output_format
    }

    pub fn report(&self) -> &DecoderReport {
        &self.report
    }

    /// Open the decoder for `format` and negotiate the audio output
    ///
    /// On success the state is `Running`. On failure nothing is left
    /// allocated and the state becomes `Terminated`.
    pub fn init(&mut self, format: &EsFormat) -> Result<()> {
        let state = self.status.get();
        if state != DecoderState::Uninitialized {
            return Err(Error::InvalidState(format!("init while {}", state)));
        }

        match self.open_pipeline(format) {
            Ok(output) => {
                info!(
                    "Decoder {} ({}) initialized: codec={} rate={} channels={}",
                    self.id,
                    self.decoder.name(),
                    format.codec,
                    output.rate,
                    output.channels
                );
                self.output_format = Some(output);
                self.clock = Some(PresentationClock::new(output.rate));
                self.status.transition(DecoderState::Running);
                Ok(())
            }
            Err(e) => {
                warn!("Decoder {} init failed for codec {}: {}", self.id, format.codec, e);
                self.release();
                self.status.transition(DecoderState::Terminated);
                Err(e)
            }
        }
    }

    fn open_pipeline(&mut self, format: &EsFormat) -> Result<AudioFormat> {
        let output = self.decoder.open(format)?;

        // On failure the caller releases both decoder and output
        self.sink
            .as_mut()
            .ok_or_else(|| Error::InvalidState("audio output already released".to_string()))?
            .negotiate(&output)?;
        Ok(output)
    }

    /// Decode until stopped, or until a fatal error
    ///
    /// Blocks are taken one at a time; a block already dequeued when the
    /// stop arrives is decoded and delivered before the loop exits.
    /// Returns only after the state is `Terminated`.
    pub fn run(&mut self) -> Result<()> {
        let state = self.status.get();
        if state != DecoderState::Running {
            return Err(Error::InvalidState(format!("run while {}", state)));
        }

        debug!("Decoder {} loop started", self.id);

        let result = loop {
            let block = match self.input.pop(&self.cancel) {
                Ok(block) => block,
                Err(_) => break Ok(()),
            };

            // A block taken just before a pause is held, not dropped; a stop
            // while paused releases the gate and the block is still processed
            self.gate.wait_while_paused(&self.cancel);

            if let Err(e) = self.process_block(block) {
                break Err(e);
            }
        };

        match &result {
            Ok(()) => {
                // May already be Draining if the owner requested the stop
                self.status.transition(DecoderState::Draining);
                debug!(
                    "Decoder {} drained: {} blocks decoded, {} frames emitted",
                    self.id, self.report.blocks_decoded, self.report.frames_emitted
                );
            }
            Err(e) => {
                error!("Decoder {} terminated on fatal error: {}", self.id, e);
                self.report.fatal = Some(e.to_string());
                self.status.publish(PipelineEvent::DecoderFailed {
                    decoder_id: self.id,
                    reason: e.to_string(),
                    timestamp: chrono::Utc::now(),
                });
            }
        }

        self.status.transition(DecoderState::Terminated);
        result
    }

    /// Decode one block and deliver its frames; only fatal errors are returned
    fn process_block(&mut self, block: Block) -> Result<()> {
        let Some(clock) = self.clock.as_mut() else {
            return Err(Error::InvalidState("decoder has no clock".to_string()));
        };

        if let Some(pts) = block.pts {
            if !clock.is_started() || block.flags.contains(BlockFlags::DISCONTINUITY) {
                trace!("Decoder {} clock set to {}", self.id, pts);
                clock.set(pts);
            }
        }
        if !clock.is_started() {
            trace!("Decoder {} dropping undated block before first timestamp", self.id);
            self.report.blocks_skipped += 1;
            return Ok(());
        }

        let frames = match self.decoder.decode(&block) {
            Ok(frames) => frames,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Decoder {} skipping block: {}", self.id, e);
                self.report.blocks_skipped += 1;
                return Ok(());
            }
        };
        drop(block);
        self.report.blocks_decoded += 1;

        let Some(sink) = self.sink.as_mut() else {
            return Err(Error::InvalidState("audio output already released".to_string()));
        };

        for frame in frames {
            // Every frame is stamped from the clock, never from the block
            let Some(pts) = clock.get() else { break };
            clock.increment(frame.frames)?;
            self.report.last_pts = Some(pts);

            match sink.play(frame, pts) {
                Ok(()) => self.report.frames_emitted += 1,
                Err(rejected) => {
                    debug!("Decoder {} frame at {} rejected: {}", self.id, pts, rejected);
                    self.report.frames_rejected += 1;
                }
            }
        }

        Ok(())
    }

    /// Release decoder state and the audio output
    ///
    /// Calling this while `Running` or `Draining` is ignored and logged.
    /// A second call after release is a no-op.
    pub fn end(&mut self) {
        let state = self.status.get();
        if matches!(state, DecoderState::Running | DecoderState::Draining) {
            warn!("Decoder {} end() ignored while {}", self.id, state);
            return;
        }
        if self.released {
            return;
        }

        self.release();
        self.status.transition(DecoderState::Terminated);
        debug!("Decoder {} released", self.id);
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.decoder.close();
        if let Some(mut sink) = self.sink.take() {
            sink.release();
        }
        self.clock = None;
    }

    /// Initialize on the calling thread, then decode on a new named thread
    ///
    /// Init failures are returned here and no thread is started.
    pub fn spawn(mut self, format: &EsFormat, thread_name: &str) -> Result<DecoderHandle> {
        self.init(format)?;

        let id = self.id;
        let cancel = self.cancel.clone();
        let gate = Arc::clone(&self.gate);
        let status = Arc::clone(&self.status);
        let input = self.input.clone();

        let guard_status = Arc::clone(&self.status);
        let mut worker = self;
        let spawned = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let _terminate = TerminateOnExit(guard_status);
                // Fatal errors are logged and recorded in the report by run()
                let _ = worker.run();
                worker.end();
                std::mem::take(&mut worker.report)
            });

        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                // The closure (and the decoder inside it) was dropped unrun
                status.transition(DecoderState::Terminated);
                return Err(Error::ResourceExhausted(format!(
                    "decoder thread '{}': {}",
                    thread_name, e
                )));
            }
        };

        info!("Decoder {} started on thread '{}'", id, thread_name);

        Ok(DecoderHandle {
            id,
            cancel,
            gate,
            status,
            input,
            join: Some(join),
        })
    }
}

impl Drop for DecoderThread {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owner's handle on a spawned decoder thread
///
/// Dropping the handle stops the decoder and joins its thread.
pub struct DecoderHandle {
    id: Uuid,
    cancel: CancelToken,
    gate: Arc<PauseGate>,
    status: Arc<DecoderStatus>,
    input: BlockQueue,
    join: Option<JoinHandle<DecoderReport>>,
}

impl DecoderHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> DecoderState {
        self.status.get()
    }

    /// Queue feeding this decoder
    pub fn input(&self) -> &BlockQueue {
        &self.input
    }

    pub fn is_finished(&self) -> bool {
        self.status.get() == DecoderState::Terminated
    }

    /// Ask the decoder to stop after its in-flight block; does not wait
    pub fn request_stop(&self) {
        self.cancel.cancel();
        self.status.transition(DecoderState::Draining);
    }

    /// Hold the decode loop; a block already dequeued waits with it
    pub fn pause(&self) {
        debug!("Decoder {} paused", self.id);
        self.gate.set(true);
    }

    pub fn resume(&self) {
        debug!("Decoder {} resumed", self.id);
        self.gate.set(false);
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Block until the decoder has reached `Terminated`
    pub fn wait_terminated(&self) {
        self.status.wait_terminated();
    }

    /// Wait for the thread to finish on its own and collect its report
    pub fn wait(mut self) -> DecoderReport {
        self.join_thread()
    }

    /// Request a stop, then wait for the decoder to quiesce
    pub fn stop(mut self) -> DecoderReport {
        self.request_stop();
        self.join_thread()
    }

    fn join_thread(&mut self) -> DecoderReport {
        let Some(join) = self.join.take() else {
            return DecoderReport {
                decoder_id: self.id,
                ..DecoderReport::default()
            };
        };

        match join.join() {
            Ok(report) => report,
            Err(_) => {
                error!("Decoder {} thread panicked", self.id);
                DecoderReport {
                    decoder_id: self.id,
                    fatal: Some("decoder thread panicked".to_string()),
                    ..DecoderReport::default()
                }
            }
        }
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.request_stop();
            self.join_thread();
        }
    }
}

impl std::fmt::Debug for DecoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderHandle")
            .field("id", &self.id)
            .field("state", &self.status.get())
            .field("paused", &self.gate.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodedFrame, PcmDecoder};
    use crate::format::FourCC;
    use crate::sink::FrameRejected;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder {
        played: Arc<Mutex<Vec<(u32, Mtime)>>>,
        released: Arc<Mutex<u32>>,
    }

    impl AudioOutput for Recorder {
        fn negotiate(&mut self, _format: &AudioFormat) -> Result<()> {
            Ok(())
        }

        fn play(
            &mut self,
            frame: DecodedFrame,
            pts: Mtime,
        ) -> std::result::Result<(), FrameRejected> {
            self.played.lock().unwrap().push((frame.frames, pts));
            Ok(())
        }

        fn release(&mut self) {
            *self.released.lock().unwrap() += 1;
        }
    }

    fn s16_mono() -> EsFormat {
        EsFormat::audio(FourCC::new(b"s16l"), 1_000, 1)
    }

    fn pcm_block(frames: usize) -> Block {
        Block::from_vec(vec![0; frames * 2])
    }

    #[test]
    fn test_init_moves_to_running() {
        let mut thread = DecoderThread::new(
            BlockQueue::new(),
            Box::new(PcmDecoder::new()),
            Box::new(Recorder::default()),
        );
        assert_eq!(thread.state(), DecoderState::Uninitialized);

        thread.init(&s16_mono()).unwrap();
        assert_eq!(thread.state(), DecoderState::Running);
        assert_eq!(thread.output_format(), Some(AudioFormat { rate: 1_000, channels: 1 }));
    }

    #[test]
    fn test_init_failure_terminates_and_releases() {
        let recorder = Recorder::default();
        let mut thread = DecoderThread::new(
            BlockQueue::new(),
            Box::new(PcmDecoder::new()),
            Box::new(recorder.clone()),
        );

        let err = thread
            .init(&EsFormat::audio(FourCC::new(b"mp4a"), 48_000, 2))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(thread.state(), DecoderState::Terminated);
        assert_eq!(*recorder.released.lock().unwrap(), 1);
    }

    #[test]
    fn test_run_requires_running() {
        let mut thread = DecoderThread::new(
            BlockQueue::new(),
            Box::new(PcmDecoder::new()),
            Box::new(Recorder::default()),
        );
        assert!(matches!(thread.run(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_run_on_caller_thread_until_cancelled() {
        let queue = BlockQueue::new();
        let recorder = Recorder::default();
        let mut thread = DecoderThread::new(
            queue.clone(),
            Box::new(PcmDecoder::new()),
            Box::new(recorder.clone()),
        );
        thread.init(&s16_mono()).unwrap();

        queue.push(pcm_block(10).with_pts(5_000)).unwrap();
        queue.push(pcm_block(10)).unwrap();

        let cancel = thread.cancel_token();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        thread.run().unwrap();
        stopper.join().unwrap();

        assert_eq!(thread.state(), DecoderState::Terminated);
        // 10 frames @ 1kHz = 10ms
        assert_eq!(*recorder.played.lock().unwrap(), vec![(10, 5_000), (10, 15_000)]);

        thread.end();
        thread.end();
        assert_eq!(*recorder.released.lock().unwrap(), 1);
    }

    #[test]
    fn test_end_ignored_while_running() {
        let recorder = Recorder::default();
        let mut thread = DecoderThread::new(
            BlockQueue::new(),
            Box::new(PcmDecoder::new()),
            Box::new(recorder.clone()),
        );
        thread.init(&s16_mono()).unwrap();

        thread.end();
        assert_eq!(thread.state(), DecoderState::Running);
        assert_eq!(*recorder.released.lock().unwrap(), 0);
    }

    #[test]
    fn test_undated_blocks_skipped_until_first_pts() {
        let recorder = Recorder::default();
        let mut thread = DecoderThread::new(
            BlockQueue::new(),
            Box::new(PcmDecoder::new()),
            Box::new(recorder.clone()),
        );
        thread.init(&s16_mono()).unwrap();

        thread.process_block(pcm_block(4)).unwrap();
        thread.process_block(pcm_block(4).with_pts(0)).unwrap();

        assert_eq!(thread.report().blocks_skipped, 1);
        assert_eq!(thread.report().blocks_decoded, 1);
        assert_eq!(*recorder.played.lock().unwrap(), vec![(4, 0)]);
    }

    #[test]
    fn test_discontinuity_reseeds_clock() {
        let recorder = Recorder::default();
        let mut thread = DecoderThread::new(
            BlockQueue::new(),
            Box::new(PcmDecoder::new()),
            Box::new(recorder.clone()),
        );
        thread.init(&s16_mono()).unwrap();

        thread.process_block(pcm_block(10).with_pts(0)).unwrap();
        // Ignored: clock already running and no discontinuity
        thread.process_block(pcm_block(10).with_pts(900_000)).unwrap();
        thread
            .process_block(
                pcm_block(10)
                    .with_pts(2_000_000)
                    .with_flags(BlockFlags::DISCONTINUITY),
            )
            .unwrap();

        assert_eq!(
            *recorder.played.lock().unwrap(),
            vec![(10, 0), (10, 10_000), (10, 2_000_000)]
        );
    }

    #[test]
    fn test_spawned_handle_stop_waits_for_quiesce() {
        let queue = BlockQueue::new();
        let recorder = Recorder::default();
        let handle = DecoderThread::new(
            queue.clone(),
            Box::new(PcmDecoder::new()),
            Box::new(recorder.clone()),
        )
        .spawn(&s16_mono(), "mpipe-dec-test")
        .unwrap();

        assert_eq!(handle.state(), DecoderState::Running);
        queue.push(pcm_block(8).with_pts(0)).unwrap();

        let cancel = CancelToken::new();
        queue.wait_empty(&cancel).unwrap();

        let report = handle.stop();
        assert_eq!(report.fatal, None);
        assert_eq!(*recorder.released.lock().unwrap(), 1);
    }
}
