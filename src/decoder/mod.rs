//! Decode engine abstraction
//!
//! The platform engine (demuxer + video decoder) is an external capability.
//! These traits model it the way hardware codec APIs expose it: a queue of
//! input slots that take compressed samples, and a queue of output slots that
//! hand back decoded images. Both queues are polled with short timeouts, so a
//! single worker thread can drive the whole engine without callbacks.
//!
//! Engines:
//! - [`y4m`]: YUV4MPEG2 container + raw pass-through decoder, always built.
//! - `ffmpeg`: FFmpeg demuxer/decoders (requires the `ffmpeg` feature).

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod hwaccel;
#[cfg(test)]
pub(crate) mod mock;
mod track;
pub mod y4m;

pub use hwaccel::{rank_decoders, DecoderCandidate, LAYOUT_PREFERENCE};
pub use track::{extract_format, select_video_track, DEFAULT_FRAME_RATE};

use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::protocol::{PixelLayout, PlaneStrides};

/// Codec parameters of one track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    /// Frames per second, 0 when the container does not say.
    pub frame_rate: u32,
    pub duration_us: i64,
    pub pixel_layout: PixelLayout,
    /// Codec-specific data (SPS/PPS for H.264, etc.).
    #[serde(skip)]
    pub codec_private: Vec<u8>,
}

impl TrackFormat {
    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }
}

/// One compressed access unit, borrowed from the container.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub data: &'a [u8],
    pub pts_us: i64,
    pub is_sync: bool,
}

/// Demuxer over one container.
pub trait Container: Send {
    fn track_count(&self) -> usize;

    fn track_format(&self, index: usize) -> Option<TrackFormat>;

    /// Restrict `read_sample` to this track.
    fn select_track(&mut self, index: usize) -> Result<()>;

    /// The sample at the read position, or `None` at end of stream.
    fn read_sample(&mut self) -> Option<Sample<'_>>;

    /// Move past the current sample. Returns false at end of stream.
    fn advance(&mut self) -> bool;

    /// Reposition at the nearest sync sample at or before `timestamp_us`.
    fn seek_to(&mut self, timestamp_us: i64) -> Result<()>;
}

/// Handle of an input slot granted by `dequeue_input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot(pub usize);

/// Handle of a decoded image held by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSlot(pub usize);

/// What goes into an input slot.
#[derive(Debug, Clone, Copy)]
pub enum InputSample<'a> {
    Data(Sample<'a>),
    /// No more samples follow until the next flush.
    EndOfStream,
}

/// Result of one output poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// Nothing ready within the timeout.
    TryAgain,
    /// The decoder settled on (or changed) its output layout.
    FormatChanged(PixelLayout),
    Frame(OutputSlot),
    /// Every frame before the end-of-stream marker has been output.
    EndOfStream,
}

/// Decoded planes borrowed from the engine for the duration of one copy.
#[derive(Debug)]
pub struct DecodedImage<'a> {
    /// Y, U, V for planar layouts; Y, UV for semi-planar.
    pub planes: Vec<&'a [u8]>,
    pub strides: PlaneStrides,
    pub timestamp_us: i64,
    pub layout: PixelLayout,
}

/// A video decoder instance. Exclusively owned by one session.
pub trait Decoder: Send {
    fn name(&self) -> &str;

    fn is_hardware(&self) -> bool {
        false
    }

    /// Apply the track format. `format.pixel_layout` is the requested output.
    fn configure(&mut self, format: &TrackFormat) -> Result<()>;

    /// Output layout after configuration (may still be `Unknown`).
    fn output_layout(&self) -> PixelLayout;

    fn start(&mut self) -> Result<()>;

    fn dequeue_input(&mut self, timeout: Duration) -> Result<Option<InputSlot>>;

    fn queue_input(&mut self, slot: InputSlot, input: InputSample<'_>) -> Result<()>;

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent>;

    fn output_image(&self, slot: OutputSlot) -> Result<DecodedImage<'_>>;

    /// Give an output slot back to the engine. Its image is invalid afterwards.
    fn release_output(&mut self, slot: OutputSlot) -> Result<()>;

    /// Drop everything queued inside the decoder; input may resume afterwards.
    fn flush(&mut self) -> Result<()>;

    fn stop(&mut self);
}

/// One entry of the engine's decoder capability list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecoderInfo {
    pub name: String,
    pub hardware: bool,
    pub mime_types: Vec<String>,
    pub layouts: Vec<PixelLayout>,
}

impl DecoderInfo {
    pub fn supports(&self, mime: &str) -> bool {
        self.mime_types.iter().any(|m| m.eq_ignore_ascii_case(mime))
    }
}

/// Factory for containers and decoders.
pub trait DecodeEngine: Send {
    fn name(&self) -> &str;

    fn open_container(&self, bytes: Vec<u8>) -> Result<Box<dyn Container>>;

    /// Decoder implementations this engine can instantiate by name.
    fn decoder_capabilities(&self) -> Vec<DecoderInfo>;

    fn create_decoder_by_name(&self, name: &str) -> Result<Box<dyn Decoder>>;

    /// Default decoder for a mime type.
    fn create_decoder_by_type(&self, mime: &str) -> Result<Box<dyn Decoder>>;
}
