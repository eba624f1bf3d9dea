//! `ms-chunk-decoder`: chunked, caller-paced video frame decoding for MasterSelects.
//!
//! A consumer (typically a render loop) asks for up to N frames at a time; the
//! session decodes exactly that many on its own thread, packs each into a
//! pooled wire buffer and reports back through a [`CompletionSink`]. At the end
//! of the stream playback loops, with the last frame of each pass flagged.
//!
//! - **Session**: `DecodeSession` (state machine), `SessionHandle` (worker thread)
//! - **Engines**: `DecodeEngine` / `Container` / `Decoder` traits, built-in Y4M engine,
//!   FFmpeg engine behind the `ffmpeg` feature
//! - **Protocol**: frame wire format (`encode_frame`, `FrameHeader`), `StreamInfo`
//! - **Cache**: `BufferPool` of exact-capacity frame buffers
//! - **Sinks**: `CompletionSink`, `ChannelSink` (crossbeam), `TokioSink` (tokio)
//! - **Errors**: `DecodeError` (thiserror-based)

pub mod cache;
pub mod config;
pub mod decoder;
pub mod error;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod worker;

pub use cache::{BufferPool, FrameBuffer, PoolStats, SharedBufferPool, StalePolicy};
pub use config::{PlaybackMode, SessionConfig, DEFAULT_POOL_CAPACITY};
pub use decoder::y4m::Y4mEngine;
pub use decoder::{Container, DecodeEngine, Decoder, DecoderInfo, TrackFormat};
pub use error::{DecodeError, Result};
pub use protocol::{
    encode_frame, parse_frame, FrameHeader, FrameIter, PixelLayout, PlaneStrides, StreamInfo,
    VideoId, WireFormat,
};
pub use session::{ChunkOutcome, DecodeSession, SessionState, SessionStats};
pub use sink::{ChannelSink, CompletionSink, SessionEvent, TokioSink};
pub use worker::SessionHandle;
