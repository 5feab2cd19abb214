//! Pipeline context
//!
//! The single owner of every running pipeline component. A binding layer or
//! CLI creates one [`PipelineContext`] and drives everything through it:
//! decoder threads, muxers, and the playlist-based playback surface built on
//! top of them. There is no process-global state.
//!
//! Lock order is `playback` before `decoders`; `muxers` is never held while
//! another context lock is taken.

mod playlist;

pub use playlist::{Playlist, PlaylistItem};

use crate::block::{BlockQueue, QueueLimits};
use crate::decoder::{Decoder, DecoderHandle, DecoderReport, DecoderState, DecoderThread};
use crate::error::{Error, Result};
use crate::format::EsFormat;
use crate::mux::{InputHandle, MuxFormat, Muxer, StreamId};
use crate::sink::{AccessOutput, AudioOutput};
use mpipe_common::config::TomlConfig;
use mpipe_common::events::PipelineEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event bus capacity; slow subscribers lag rather than block the pipeline
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything needed to start one decoder thread
pub struct DecodeTask {
    pub format: EsFormat,
    pub input: BlockQueue,
    pub decoder: Box<dyn Decoder>,
    pub sink: Box<dyn AudioOutput>,
}

/// Turns a playlist item into a decode task
///
/// Implementations own demuxing: they start whatever feeds `input` and
/// report the elementary stream format it carries.
pub trait SourceOpener: Send + Sync {
    fn open(&self, item: &PlaylistItem, limits: QueueLimits) -> Result<DecodeTask>;
}

/// Outcome of [`PipelineContext::mux_all`]
#[derive(Debug, Default)]
pub struct MuxRound {
    /// Blocks written across all muxers
    pub written: usize,
    /// Muxers whose `mux()` failed this round
    pub failures: Vec<(Uuid, Error)>,
}

struct NowPlaying {
    item_id: u32,
    decoder_id: Uuid,
}

#[derive(Default)]
struct Playback {
    playlist: Playlist,
    now_playing: Option<NowPlaying>,
}

pub struct PipelineContext {
    config: TomlConfig,
    events: broadcast::Sender<PipelineEvent>,
    decoders: Mutex<HashMap<Uuid, DecoderHandle>>,
    muxers: Mutex<HashMap<Uuid, Arc<Muxer>>>,
    playback: Mutex<Playback>,
    opener: Option<Arc<dyn SourceOpener>>,
    thread_seq: AtomicU64,
}

impl PipelineContext {
    pub fn new(config: TomlConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            events,
            decoders: Mutex::new(HashMap::new()),
            muxers: Mutex::new(HashMap::new()),
            playback: Mutex::new(Playback::default()),
            opener: None,
            thread_seq: AtomicU64::new(0),
        }
    }

    /// Install the opener used by [`play`](Self::play)
    pub fn with_source_opener(mut self, opener: Arc<dyn SourceOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn config(&self) -> &TomlConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits::from(self.config.queue)
    }

    /// New queue bounded by the configured limits
    pub fn create_queue(&self) -> BlockQueue {
        BlockQueue::with_limits(self.queue_limits())
    }

    // ========================================================================
    // Decoders
    // ========================================================================

    /// Initialize and start a decoder thread
    pub fn start_decoder(&self, task: DecodeTask) -> Result<Uuid> {
        let seq = self.thread_seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.config.decoder.thread_name_prefix, seq);

        let handle = DecoderThread::with_events(
            task.input,
            task.decoder,
            task.sink,
            self.events.clone(),
        )
        .spawn(&task.format, &name)?;

        let id = handle.id();
        lock(&self.decoders).insert(id, handle);
        Ok(id)
    }

    /// Stop a decoder and block until it has quiesced
    pub fn stop_decoder(&self, id: Uuid) -> Result<DecoderReport> {
        let handle = lock(&self.decoders)
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("decoder {}", id)))?;
        Ok(handle.stop())
    }

    pub fn pause_decoder(&self, id: Uuid) -> Result<()> {
        self.with_decoder(id, DecoderHandle::pause)
    }

    pub fn resume_decoder(&self, id: Uuid) -> Result<()> {
        self.with_decoder(id, DecoderHandle::resume)
    }

    pub fn decoder_state(&self, id: Uuid) -> Option<DecoderState> {
        lock(&self.decoders).get(&id).map(DecoderHandle::state)
    }

    pub fn decoder_count(&self) -> usize {
        lock(&self.decoders).len()
    }

    /// Collect reports from decoders that terminated on their own
    pub fn reap_decoders(&self) -> Vec<DecoderReport> {
        let finished: Vec<DecoderHandle> = {
            let mut decoders = lock(&self.decoders);
            let ids: Vec<Uuid> = decoders
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| decoders.remove(id)).collect()
        };
        finished.into_iter().map(DecoderHandle::wait).collect()
    }

    fn with_decoder(&self, id: Uuid, f: impl FnOnce(&DecoderHandle)) -> Result<()> {
        let decoders = lock(&self.decoders);
        let handle = decoders
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("decoder {}", id)))?;
        f(handle);
        Ok(())
    }

    // ========================================================================
    // Muxers
    // ========================================================================

    /// Create a muxer for `format` and open it on `access`
    pub fn open_muxer(
        &self,
        format: Box<dyn MuxFormat>,
        access: Box<dyn AccessOutput>,
    ) -> Result<Uuid> {
        let muxer = Muxer::new(format)
            .with_queue_limits(self.queue_limits())
            .with_add_stream_wait(self.config.mux.add_stream_wait_us)
            .with_events(self.events.clone());
        muxer.open(access)?;

        let id = muxer.id();
        lock(&self.muxers).insert(id, Arc::new(muxer));
        Ok(id)
    }

    pub fn muxer(&self, id: Uuid) -> Option<Arc<Muxer>> {
        lock(&self.muxers).get(&id).cloned()
    }

    pub fn attach_stream(&self, muxer_id: Uuid, format: EsFormat) -> Result<InputHandle> {
        self.require_muxer(muxer_id)?.add_stream(format)
    }

    pub fn detach_stream(&self, muxer_id: Uuid, stream: StreamId) -> Result<usize> {
        self.require_muxer(muxer_id)?.del_stream(stream)
    }

    /// Run one `mux()` pass on every open muxer
    ///
    /// A failing muxer is reported in the result and does not stop the
    /// others from being serviced.
    pub fn mux_all(&self) -> MuxRound {
        let muxers: Vec<Arc<Muxer>> = lock(&self.muxers).values().cloned().collect();

        let mut round = MuxRound::default();
        for muxer in muxers {
            match muxer.mux() {
                Ok(written) => round.written += written,
                Err(e) => round.failures.push((muxer.id(), e)),
            }
        }
        round
    }

    /// Close a muxer and drop it from the context
    pub fn close_muxer(&self, id: Uuid) -> Result<()> {
        let muxer = lock(&self.muxers)
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("muxer {}", id)))?;
        muxer.close()
    }

    pub fn muxer_count(&self) -> usize {
        lock(&self.muxers).len()
    }

    fn require_muxer(&self, id: Uuid) -> Result<Arc<Muxer>> {
        self.muxer(id)
            .ok_or_else(|| Error::NotFound(format!("muxer {}", id)))
    }

    // ========================================================================
    // Playback
    // ========================================================================

    pub fn add_source(&self, uri: &str, name: &str, options: Vec<String>) -> u32 {
        lock(&self.playback).playlist.add(uri, name, options)
    }

    /// Start playing `item`, or the current item, or the first item
    ///
    /// Whatever was playing is stopped first. Returns the item id now playing.
    pub fn play(&self, item: Option<u32>) -> Result<u32> {
        let mut playback = lock(&self.playback);

        let current = playback.playlist.current().cloned();
        let target = match item {
            Some(id) => playback.playlist.select(id)?.clone(),
            None => match current {
                Some(current) => current,
                None => playback
                    .playlist
                    .next()
                    .cloned()
                    .ok_or_else(|| Error::NotFound("playlist is empty".to_string()))?,
            },
        };

        self.start_item(&mut playback, target)
    }

    /// Toggle pause on the playing item; returns true when now paused
    pub fn pause(&self) -> Result<bool> {
        let playback = lock(&self.playback);
        let now_playing = playback
            .now_playing
            .as_ref()
            .ok_or_else(|| Error::InvalidState("nothing is playing".to_string()))?;

        let decoders = lock(&self.decoders);
        let handle = decoders
            .get(&now_playing.decoder_id)
            .ok_or_else(|| Error::NotFound(format!("decoder {}", now_playing.decoder_id)))?;

        if handle.is_paused() {
            handle.resume();
            Ok(false)
        } else {
            handle.pause();
            Ok(true)
        }
    }

    /// Stop playback and block until the decoder has fully quiesced
    ///
    /// Returns the stopped decoder's report, or `None` if nothing was playing.
    pub fn stop(&self) -> Result<Option<DecoderReport>> {
        let mut playback = lock(&self.playback);
        self.stop_playing(&mut playback)
    }

    /// Play the next item; `None` at the end of a non-looping playlist
    pub fn next(&self) -> Result<Option<u32>> {
        let mut playback = lock(&self.playback);
        let Some(target) = playback.playlist.next().cloned() else {
            return Ok(None);
        };
        self.start_item(&mut playback, target).map(Some)
    }

    /// Play the previous item; `None` at the start of a non-looping playlist
    pub fn previous(&self) -> Result<Option<u32>> {
        let mut playback = lock(&self.playback);
        let Some(target) = playback.playlist.previous().cloned() else {
            return Ok(None);
        };
        self.start_item(&mut playback, target).map(Some)
    }

    /// Stop playback and empty the playlist
    pub fn clear(&self) -> Result<()> {
        let mut playback = lock(&self.playback);
        self.stop_playing(&mut playback)?;
        playback.playlist.clear();
        Ok(())
    }

    /// Remove an item, stopping it first if it is playing
    pub fn remove(&self, item_id: u32) -> Result<()> {
        let mut playback = lock(&self.playback);
        if playback
            .now_playing
            .as_ref()
            .is_some_and(|now| now.item_id == item_id)
        {
            self.stop_playing(&mut playback)?;
        }
        playback.playlist.remove(item_id)?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        lock(&self.playback).playlist.count()
    }

    /// True while an item is decoding and not paused
    pub fn is_active(&self) -> bool {
        let playback = lock(&self.playback);
        let Some(now_playing) = playback.now_playing.as_ref() else {
            return false;
        };

        lock(&self.decoders)
            .get(&now_playing.decoder_id)
            .is_some_and(|handle| handle.state() == DecoderState::Running && !handle.is_paused())
    }

    pub fn set_loop(&self, enabled: bool) {
        lock(&self.playback).playlist.set_loop(enabled);
    }

    /// Id of the item currently playing
    pub fn now_playing(&self) -> Option<u32> {
        lock(&self.playback)
            .now_playing
            .as_ref()
            .map(|now| now.item_id)
    }

    fn start_item(&self, playback: &mut Playback, item: PlaylistItem) -> Result<u32> {
        self.stop_playing(playback)?;

        let opener = self
            .opener
            .as_ref()
            .ok_or_else(|| Error::Unsupported("no source opener installed".to_string()))?;
        let task = opener.open(&item, self.queue_limits())?;
        let decoder_id = self.start_decoder(task)?;

        info!("Playing item {} ({}) on decoder {}", item.id, item.uri, decoder_id);
        playback.now_playing = Some(NowPlaying {
            item_id: item.id,
            decoder_id,
        });
        Ok(item.id)
    }

    fn stop_playing(&self, playback: &mut Playback) -> Result<Option<DecoderReport>> {
        let Some(now_playing) = playback.now_playing.take() else {
            return Ok(None);
        };

        match self.stop_decoder(now_playing.decoder_id) {
            Ok(report) => {
                debug!("Stopped item {}", now_playing.item_id);
                Ok(Some(report))
            }
            // Already reaped
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop every decoder and close every muxer
    ///
    /// All decoders are signalled before any is waited on, so shutdown takes
    /// as long as the slowest decoder rather than the sum of them.
    pub fn shutdown(&self) -> Vec<DecoderReport> {
        lock(&self.playback).now_playing = None;

        let handles: Vec<DecoderHandle> = lock(&self.decoders).drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.request_stop();
        }
        let reports: Vec<DecoderReport> = handles.into_iter().map(DecoderHandle::wait).collect();

        let muxers: Vec<Arc<Muxer>> = lock(&self.muxers).drain().map(|(_, m)| m).collect();
        for muxer in muxers {
            if let Err(e) = muxer.close() {
                warn!("Muxer {} failed to close cleanly: {}", muxer.id(), e);
            }
        }

        info!("Pipeline shut down ({} decoder(s) stopped)", reports.len());
        reports
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new(TomlConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
