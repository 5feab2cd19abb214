//! mpipe - command-line driver for the media pipeline core
//!
//! - `mpipe mux`: wrap JPEG files as a multipart (mpjpeg) stream
//! - `mpipe decode`: decode raw PCM through a decoder thread and print its report
//! - `mpipe control`: answer a muxer control query

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use mpipe_common::config::{LoggingConfig, TomlConfig};
use mpipe_common::events::PipelineEvent;
use mpipe_common::time::samples_to_mtime;
use mpipe_core::block::{Block, BlockFlags, BlockQueue, CancelToken};
use mpipe_core::context::{DecodeTask, PipelineContext};
use mpipe_core::decoder::PcmDecoder;
use mpipe_core::format::{EsFormat, FourCC};
use mpipe_core::mux::{MpjpegFormat, MuxQuery, MuxReply};
use mpipe_core::sink::{AudioConsumer, RingBufferOutput, RingBufferStats, WriterAccess};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Presentation interval between muxed JPEG frames (25 fps)
const FRAME_INTERVAL_US: i64 = 40_000;

/// Simulated device callback period for `decode`
const DEVICE_PERIOD: Duration = Duration::from_millis(2);

/// Command-line arguments for mpipe
#[derive(Parser, Debug)]
#[command(name = "mpipe")]
#[command(about = "Media pipeline core driver")]
#[command(version)]
struct Args {
    /// Config file (overrides MPIPE_CONFIG and the default location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mux JPEG files into a multipart/x-mixed-replace stream
    Mux {
        /// Output file, or "-" for stdout
        #[arg(short, long, default_value = "-")]
        output: String,

        /// Terminate the stream with a closing boundary
        #[arg(long)]
        final_boundary: bool,

        /// JPEG frames, in presentation order
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },

    /// Decode a raw PCM file and print the decoder report as JSON
    Decode {
        #[arg(long, default_value_t = 48_000)]
        rate: u32,

        #[arg(long, default_value_t = 2)]
        channels: u16,

        /// s16l or f32l
        #[arg(long, default_value = "s16l")]
        codec: String,

        /// Sample frames per input block
        #[arg(long, default_value_t = 1024)]
        block_frames: usize,

        input: PathBuf,
    },

    /// Send a control query to an mpjpeg muxer
    Control {
        /// e.g. get-mime, can-add-stream-while-muxing, get-add-stream-wait
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!("Starting mpipe {}", env!("CARGO_PKG_VERSION"));

    let ctx = PipelineContext::new(config);
    let event_logger = spawn_event_logger(ctx.subscribe());

    let result = match args.command {
        Command::Mux {
            output,
            final_boundary,
            frames,
        } => run_mux(&ctx, &output, final_boundary, &frames),
        Command::Decode {
            rate,
            channels,
            codec,
            block_frames,
            input,
        } => run_decode(&ctx, rate, channels, &codec, block_frames, &input),
        Command::Control { query } => run_control(&ctx, &query),
    };

    ctx.shutdown();
    drop(ctx);
    let _ = event_logger.await;

    result
}

/// Initialize tracing from the `[logging]` section
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("mpipe={0},mpipe_core={0},mpipe_common={0}", logging.level).into());

    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    // stdout carries muxed data, so console logging goes to stderr
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn spawn_event_logger(
    mut events: broadcast::Receiver<PipelineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(event_type = event.event_type(), "{:?}", event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, {} event(s) skipped", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn run_mux(
    ctx: &PipelineContext,
    output: &str,
    final_boundary: bool,
    frames: &[PathBuf],
) -> Result<()> {
    let writer: Box<dyn Write + Send> = if output == "-" {
        Box::new(BufWriter::new(io::stdout()))
    } else {
        let file = std::fs::File::create(output)
            .with_context(|| format!("Failed to create {}", output))?;
        Box::new(BufWriter::new(file))
    };

    let format = MpjpegFormat::from_config(&ctx.config().mux)
        .with_final_boundary(ctx.config().mux.emit_final_boundary || final_boundary);
    let muxer_id = ctx.open_muxer(Box::new(format), Box::new(WriterAccess::new(writer)))?;
    if let Some(MuxReply::Mime(mime)) = ctx
        .muxer(muxer_id)
        .and_then(|muxer| muxer.control(&MuxQuery::Mime).ok())
    {
        info!("Content-Type: {}", mime);
    }
    let input = ctx.attach_stream(muxer_id, EsFormat::video(FourCC::new(b"MJPG")))?;

    for (index, path) in frames.iter().enumerate() {
        let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let block = Block::from_vec(data)
            .with_pts(index as i64 * FRAME_INTERVAL_US)
            .with_duration(FRAME_INTERVAL_US)
            .with_flags(BlockFlags::KEYFRAME);
        input.push(block)?;

        let round = ctx.mux_all();
        if let Some((_, e)) = round.failures.into_iter().next() {
            return Err(e).context("Muxing failed");
        }
    }

    ctx.close_muxer(muxer_id)?;
    info!("Muxed {} frame(s) to {}", frames.len(), output);
    Ok(())
}

fn run_decode(
    ctx: &PipelineContext,
    rate: u32,
    channels: u16,
    codec: &str,
    block_frames: usize,
    input: &Path,
) -> Result<()> {
    let codec: FourCC = codec.parse().map_err(|e: String| anyhow!(e))?;
    if !PcmDecoder::supports(codec) {
        bail!("Unsupported codec '{}' (expected s16l or f32l)", codec);
    }
    if channels == 0 || block_frames == 0 {
        bail!("channels and block-frames must be non-zero");
    }

    let data = std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let bytes_per_sample = if codec == FourCC::new(b"s16l") { 2 } else { 4 };
    let frame_bytes = bytes_per_sample * channels as usize;
    let block_samples = block_frames * channels as usize;

    // Room for the whole file: the simulated device never applies backpressure
    let ring_samples = (data.len() / bytes_per_sample).max(block_samples).max(2048);
    let (output, consumer) = RingBufferOutput::new(Some(ring_samples));
    let queue = ctx.create_queue();
    let decoder_id = ctx.start_decoder(DecodeTask {
        format: EsFormat::audio(codec, rate, channels),
        input: queue.clone(),
        decoder: Box::new(PcmDecoder::new()),
        sink: Box::new(output),
    })?;
    let device = std::thread::Builder::new()
        .name("mpipe-device".to_string())
        .spawn(move || drain_device(consumer))
        .context("Failed to start device thread")?;

    let cancel = CancelToken::new();
    let mut pts = 0;
    for chunk in data.chunks(block_frames * frame_bytes) {
        wait_for_room(&queue, &cancel)?;
        queue.push(Block::try_copy_from_slice(chunk)?.with_pts(pts))?;
        pts += samples_to_mtime((chunk.len() / frame_bytes) as u64, rate);
    }

    queue
        .wait_empty(&cancel)
        .map_err(|e| anyhow!("Decoder input never drained: {}", e))?;
    let report = ctx.stop_decoder(decoder_id)?;
    let device_stats = device
        .join()
        .map_err(|_| anyhow!("Device thread panicked"))?;

    info!(
        "Device played {} frame(s), {} underrun(s), {} overrun(s)",
        device_stats.frames_played, device_stats.underruns, device_stats.overruns
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(reason) = &report.fatal {
        bail!("Decoder failed: {}", reason);
    }
    Ok(())
}

/// Back off while a bounded queue is full
fn wait_for_room(queue: &BlockQueue, cancel: &CancelToken) -> Result<()> {
    if queue.is_full() {
        queue
            .wait_empty(cancel)
            .map_err(|e| anyhow!("Waiting for decoder input: {}", e))?;
    }
    Ok(())
}

/// Pull samples the way a device callback would until the producer is released
fn drain_device(mut consumer: AudioConsumer) -> RingBufferStats {
    let mut period = vec![0.0f32; 1024];
    while !consumer.is_finished() {
        if consumer.pop_slice(&mut period) == 0 {
            std::thread::sleep(DEVICE_PERIOD);
        }
    }
    consumer.stats()
}

fn run_control(ctx: &PipelineContext, query: &str) -> Result<()> {
    let format = MpjpegFormat::from_config(&ctx.config().mux);
    let muxer_id = ctx.open_muxer(Box::new(format), Box::new(WriterAccess::new(io::sink())))?;
    let muxer = ctx
        .muxer(muxer_id)
        .ok_or_else(|| anyhow!("Muxer {} vanished", muxer_id))?;

    let query: MuxQuery = query.parse().map_err(|e| anyhow!("{:?}", e))?;
    match muxer.control(&query) {
        Ok(MuxReply::Bool(value)) => println!("{}", value),
        Ok(MuxReply::Mime(mime)) => println!("{}", mime),
        Err(mpipe_core::Error::Unsupported(reason)) => println!("unsupported: {}", reason),
        Err(e) => return Err(e.into()),
    }

    ctx.close_muxer(muxer_id)?;
    Ok(())
}
