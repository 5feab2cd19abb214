//! Pipeline context tests
//!
//! Playlist-driven playback through a test source opener, plus decoder and
//! muxer bookkeeping on the context.

mod helpers;

use helpers::{pcm_block, pcm_format, AudioCapture};
use mpipe_common::config::TomlConfig;
use mpipe_core::block::{BlockQueue, QueueLimits};
use mpipe_core::context::{DecodeTask, PipelineContext, PlaylistItem, SourceOpener};
use mpipe_core::decoder::{DecoderState, PcmDecoder};
use mpipe_core::format::{EsFormat, FourCC};
use mpipe_core::mux::MpjpegFormat;
use mpipe_core::sink::MemoryAccess;
use mpipe_core::{Error, Result};
use std::sync::{Arc, Mutex};

/// Opener that feeds each item a few PCM blocks and records what it opened
#[derive(Default)]
struct TestOpener {
    opened: Mutex<Vec<u32>>,
    capture: AudioCapture,
}

impl TestOpener {
    fn opened(&self) -> Vec<u32> {
        self.opened.lock().unwrap().clone()
    }
}

impl SourceOpener for TestOpener {
    fn open(&self, item: &PlaylistItem, limits: QueueLimits) -> Result<DecodeTask> {
        if item.uri.starts_with("missing:") {
            return Err(Error::NotFound(item.uri.clone()));
        }
        self.opened.lock().unwrap().push(item.id);

        let input = BlockQueue::with_limits(limits);
        input.push(pcm_block(10).with_pts(0))?;
        input.push(pcm_block(10))?;

        Ok(DecodeTask {
            format: pcm_format(),
            input,
            decoder: Box::new(PcmDecoder::new()),
            sink: Box::new(self.capture.clone()),
        })
    }
}

fn context_with_items(count: usize) -> (PipelineContext, Arc<TestOpener>) {
    let opener = Arc::new(TestOpener::default());
    let ctx = PipelineContext::new(TomlConfig::default()).with_source_opener(opener.clone());
    for i in 0..count {
        ctx.add_source(&format!("test:{}", i), &format!("item {}", i), Vec::new());
    }
    (ctx, opener)
}

#[test]
fn test_play_stop_cycle() {
    let (ctx, opener) = context_with_items(2);
    assert_eq!(ctx.count(), 2);

    assert_eq!(ctx.play(None).unwrap(), 1);
    assert!(ctx.is_active());
    assert_eq!(ctx.now_playing(), Some(1));
    assert_eq!(ctx.decoder_count(), 1);

    let report = ctx.stop().unwrap().expect("a decoder was playing");
    assert_eq!(report.fatal, None);
    assert!(!ctx.is_active());
    assert_eq!(ctx.now_playing(), None);
    assert_eq!(ctx.decoder_count(), 0);
    assert_eq!(opener.opened(), vec![1]);

    // Stopping when idle is not an error
    assert!(ctx.stop().unwrap().is_none());
}

#[test]
fn test_stop_returns_after_decoder_quiesced() {
    let (ctx, opener) = context_with_items(1);
    ctx.play(None).unwrap();
    ctx.stop().unwrap();

    // The output has been released by the time stop() returns
    assert_eq!(opener.capture.releases(), 1);
}

#[test]
fn test_next_and_previous() {
    let (ctx, opener) = context_with_items(3);

    ctx.play(Some(2)).unwrap();
    assert_eq!(ctx.next().unwrap(), Some(3));
    assert_eq!(ctx.next().unwrap(), None);
    assert_eq!(ctx.now_playing(), Some(3));

    assert_eq!(ctx.previous().unwrap(), Some(2));
    assert_eq!(opener.opened(), vec![2, 3, 2]);
    assert_eq!(ctx.decoder_count(), 1);
}

#[test]
fn test_loop_wraps_next() {
    let (ctx, _opener) = context_with_items(2);
    ctx.set_loop(true);

    ctx.play(Some(2)).unwrap();
    assert_eq!(ctx.next().unwrap(), Some(1));
}

#[test]
fn test_pause_toggles() {
    let (ctx, _opener) = context_with_items(1);
    assert!(matches!(ctx.pause(), Err(Error::InvalidState(_))));

    ctx.play(None).unwrap();
    assert!(ctx.pause().unwrap());
    assert!(!ctx.is_active());
    assert!(!ctx.pause().unwrap());
    assert!(ctx.is_active());
}

#[test]
fn test_remove_playing_item_stops_it() {
    let (ctx, _opener) = context_with_items(2);
    ctx.play(Some(1)).unwrap();

    ctx.remove(1).unwrap();
    assert!(!ctx.is_active());
    assert_eq!(ctx.count(), 1);
    assert_eq!(ctx.decoder_count(), 0);

    assert!(matches!(ctx.remove(1), Err(Error::NotFound(_))));
}

#[test]
fn test_clear_stops_and_empties() {
    let (ctx, _opener) = context_with_items(3);
    ctx.play(None).unwrap();

    ctx.clear().unwrap();
    assert_eq!(ctx.count(), 0);
    assert!(!ctx.is_active());
    assert!(matches!(ctx.play(None), Err(Error::NotFound(_))));
}

#[test]
fn test_open_failure_propagates() {
    let opener = Arc::new(TestOpener::default());
    let ctx = PipelineContext::default().with_source_opener(opener);
    let id = ctx.add_source("missing:nothing", "gone", Vec::new());

    assert!(matches!(ctx.play(Some(id)), Err(Error::NotFound(_))));
    assert!(!ctx.is_active());
    assert_eq!(ctx.decoder_count(), 0);
}

#[test]
fn test_decoder_registry() {
    let ctx = PipelineContext::default();
    let capture = AudioCapture::new();
    let id = ctx
        .start_decoder(DecodeTask {
            format: pcm_format(),
            input: ctx.create_queue(),
            decoder: Box::new(PcmDecoder::new()),
            sink: Box::new(capture.clone()),
        })
        .unwrap();

    assert_eq!(ctx.decoder_state(id), Some(DecoderState::Running));
    ctx.pause_decoder(id).unwrap();
    ctx.resume_decoder(id).unwrap();

    ctx.stop_decoder(id).unwrap();
    assert_eq!(ctx.decoder_state(id), None);
    assert!(matches!(ctx.stop_decoder(id), Err(Error::NotFound(_))));
    assert_eq!(capture.releases(), 1);
}

#[test]
fn test_start_decoder_with_bad_format_registers_nothing() {
    let ctx = PipelineContext::default();
    let err = ctx
        .start_decoder(DecodeTask {
            format: EsFormat::video(FourCC::new(b"MJPG")),
            input: ctx.create_queue(),
            decoder: Box::new(PcmDecoder::new()),
            sink: Box::new(AudioCapture::new()),
        })
        .unwrap_err();

    assert!(matches!(err, Error::Unsupported(_)));
    assert_eq!(ctx.decoder_count(), 0);
}

#[test]
fn test_shutdown_stops_everything() {
    let (ctx, opener) = context_with_items(1);
    ctx.play(None).unwrap();
    ctx.open_muxer(Box::new(MpjpegFormat::new()), Box::new(MemoryAccess::new()))
        .unwrap();

    let reports = ctx.shutdown();
    assert_eq!(reports.len(), 1);
    assert_eq!(ctx.decoder_count(), 0);
    assert_eq!(ctx.muxer_count(), 0);
    assert!(!ctx.is_active());
    assert_eq!(opener.capture.releases(), 1);
}

#[test]
fn test_queue_limits_come_from_config() {
    let config = TomlConfig::from_toml_str("[queue]\nmax_blocks = 3\n").unwrap();
    let ctx = PipelineContext::new(config);

    let queue = ctx.create_queue();
    assert_eq!(queue.limits().max_blocks, Some(3));
    assert_eq!(queue.limits().max_bytes, None);
}
