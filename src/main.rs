//! MasterSelects Chunk Decoder
//!
//! Command-line front end for the chunked decode pipeline: probe a video,
//! decode it chunk by chunk into a wire-frame dump, inspect such a dump, or
//! generate a synthetic Y4M test stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ms_chunk_decoder::decoder::y4m::{synth_stream, Y4mEngine};
use ms_chunk_decoder::{
    DecodeEngine, FrameIter, PlaybackMode, SessionConfig, SessionEvent, SessionHandle,
    StreamInfo, TokioSink, VideoId, WireFormat,
};

/// MasterSelects Chunk Decoder - caller-paced video frame decoding
#[derive(Parser, Debug)]
#[command(name = "ms-chunk-decoder")]
#[command(about = "Chunked video frame decoder for MasterSelects")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Decode engine
    #[arg(long, value_enum, default_value = "y4m", global = true)]
    engine: EngineKind,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a session and print the stream info as JSON
    Probe { input: PathBuf },

    /// Decode chunks of frames, optionally dumping the wire frames to a file
    Decode {
        input: PathBuf,

        /// File receiving every encoded frame back to back
        #[arg(long)]
        out: Option<PathBuf>,

        /// Frames per chunk
        #[arg(long, default_value = "30")]
        chunk: u32,

        /// Number of chunks to request
        #[arg(long, default_value = "10")]
        chunks: u32,

        /// Stop at end of stream instead of looping
        #[arg(long)]
        single_shot: bool,

        /// Use the 20-byte legacy frame header
        #[arg(long)]
        legacy_wire: bool,

        /// Maximum number of pooled frame buffers
        #[arg(long)]
        pool_cap: Option<usize>,

        /// Session config JSON; flags above override it
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Summarize a wire-frame dump written by `decode --out`
    Inspect {
        input: PathBuf,

        /// The dump uses the 20-byte legacy frame header
        #[arg(long)]
        legacy_wire: bool,
    },

    /// Write a synthetic planar 4:2:0 Y4M stream
    Synth {
        output: PathBuf,

        #[arg(long, default_value = "320")]
        width: u32,

        #[arg(long, default_value = "240")]
        height: u32,

        #[arg(long, default_value = "30")]
        fps: u32,

        #[arg(long, default_value = "5")]
        seconds: u32,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    Y4m,
    Ffmpeg,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    match args.command {
        Command::Probe { input } => probe(args.engine, input).await,
        Command::Decode {
            input,
            out,
            chunk,
            chunks,
            single_shot,
            legacy_wire,
            pool_cap,
            config,
        } => {
            let mut session_config = match config {
                Some(path) => SessionConfig::from_json_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => SessionConfig::default(),
            };
            if single_shot {
                session_config = session_config.with_playback_mode(PlaybackMode::SingleShot);
            }
            if legacy_wire {
                session_config = session_config.with_wire_format(WireFormat::Legacy);
            }
            if let Some(cap) = pool_cap {
                session_config = session_config.with_pool_capacity(cap);
            }
            decode(args.engine, input, out, chunk, chunks, session_config).await
        }
        Command::Inspect { input, legacy_wire } => {
            let format = if legacy_wire {
                WireFormat::Legacy
            } else {
                WireFormat::Standard
            };
            inspect(input, format).await
        }
        Command::Synth {
            output,
            width,
            height,
            fps,
            seconds,
        } => synth(output, width, height, fps, seconds).await,
    }
}

fn init_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    // stdout carries JSON output only
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn make_engine(kind: EngineKind) -> Result<Box<dyn DecodeEngine>> {
    match kind {
        EngineKind::Y4m => Ok(Box::new(Y4mEngine)),
        #[cfg(feature = "ffmpeg")]
        EngineKind::Ffmpeg => {
            let engine = ms_chunk_decoder::decoder::ffmpeg::FfmpegEngine::new()
                .context("Failed to initialize FFmpeg")?;
            Ok(Box::new(engine))
        }
        #[cfg(not(feature = "ffmpeg"))]
        EngineKind::Ffmpeg => bail!("built without the `ffmpeg` feature"),
    }
}

/// Spawn a session for `input` and wait for `on_initialized`.
async fn open_session(
    engine: EngineKind,
    input: &Path,
    config: SessionConfig,
) -> Result<(SessionHandle, UnboundedReceiver<SessionEvent>, StreamInfo)> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let (sink, mut events) = TokioSink::unbounded();
    let handle = SessionHandle::spawn(VideoId(1), make_engine(engine)?, Arc::new(sink), config)?;
    handle.initialize(bytes)?;

    loop {
        match events.recv().await {
            Some(SessionEvent::Initialized(info)) => return Ok((handle, events, info)),
            Some(SessionEvent::Error { code, message, .. }) => bail!("{}: {}", code, message),
            Some(_) => {}
            None => bail!("session ended before initializing"),
        }
    }
}

async fn probe(engine: EngineKind, input: PathBuf) -> Result<()> {
    let (mut handle, _events, info) = open_session(engine, &input, SessionConfig::default()).await?;
    tokio::task::block_in_place(|| handle.release());
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn decode(
    engine: EngineKind,
    input: PathBuf,
    out: Option<PathBuf>,
    chunk: u32,
    chunks: u32,
    config: SessionConfig,
) -> Result<()> {
    let wire_format = config.wire_format;
    let (mut handle, mut events, info) = open_session(engine, &input, config).await?;
    info!(
        "Decoding {} chunks of {} frames from {}",
        chunks,
        chunk,
        input.display()
    );

    let mut dump = match &out {
        Some(path) => Some(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => None,
    };

    let mut frames = 0u64;
    let mut bytes_written = 0u64;
    let mut ended = false;

    for index in 0..chunks {
        if !handle.decode_chunk(chunk)? {
            bail!("chunk {} rejected while another was in flight", index);
        }

        loop {
            match events.recv().await {
                Some(SessionEvent::Frame { frame, .. }) => {
                    frames += 1;
                    if let Some(file) = dump.as_mut() {
                        file.write_all(frame.as_bytes()).await?;
                        bytes_written += frame.len() as u64;
                    }
                    handle.release_buffer(frame);
                }
                Some(SessionEvent::ChunkComplete(_)) => break,
                Some(SessionEvent::EndOfStream(_)) => ended = true,
                Some(SessionEvent::Error { code, message, .. }) => bail!("{}: {}", code, message),
                Some(SessionEvent::Initialized(_)) => {}
                None => bail!("session ended mid-chunk"),
            }
        }
        debug!("Chunk {} complete, {} frames so far", index, frames);

        if ended {
            break;
        }
    }

    if let Some(mut file) = dump {
        file.flush().await?;
    }

    let pool = handle.pool().stats();
    let stats = handle.stats();
    // Joins the decode thread
    tokio::task::block_in_place(|| handle.release());

    let report = json!({
        "stream": info,
        "wire_format": wire_format,
        "frames": frames,
        "bytes_written": bytes_written,
        "session": stats,
        "pool": pool,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn inspect(input: PathBuf, format: WireFormat) -> Result<()> {
    let data = tokio::fs::read(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let mut frames = 0u64;
    let mut eos_frames = 0u64;
    let mut loop_boundaries = 0u64;
    let mut payload_bytes = 0u64;
    let mut first_ts = None;
    let mut last_ts: Option<i64> = None;

    for entry in FrameIter::new(&data, format) {
        let (header, payload) = entry.with_context(|| format!("frame {} is malformed", frames))?;

        if let Some(prev) = last_ts {
            if header.timestamp_us < prev {
                loop_boundaries += 1;
            }
        }
        first_ts.get_or_insert(header.timestamp_us);
        last_ts = Some(header.timestamp_us);

        frames += 1;
        payload_bytes += payload.len() as u64;
        if header.end_of_stream {
            eos_frames += 1;
        }
    }

    let report = json!({
        "frames": frames,
        "eos_frames": eos_frames,
        "loop_boundaries": loop_boundaries,
        "payload_bytes": payload_bytes,
        "first_timestamp_us": first_ts,
        "last_timestamp_us": last_ts,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn synth_frame_count(fps: u32, seconds: u32) -> Result<usize> {
    match fps.checked_mul(seconds) {
        Some(frames) => Ok(frames as usize),
        None => bail!("{} fps for {} s is too many frames", fps, seconds),
    }
}

async fn synth(output: PathBuf, width: u32, height: u32, fps: u32, seconds: u32) -> Result<()> {
    if width == 0 || height == 0 || fps == 0 {
        bail!("width, height and fps must be non-zero");
    }

    let frames = synth_frame_count(fps, seconds)?;
    let stream = synth_stream(width, height, fps, frames);
    tokio::fs::write(&output, &stream)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        "Wrote {} frames ({}x{} @ {} fps) to {}",
        frames,
        width,
        height,
        fps,
        output.display()
    );
    Ok(())
}
