//! FFmpeg decode engine
//!
//! Demuxes with libavformat and decodes with libavcodec. The container gets
//! the video bytes through a temporary file, since avformat wants a path.
//! Packet timestamps are rescaled to microseconds on read, and decoders are
//! opened with a microsecond packet time base so frame timestamps come back
//! in the same unit.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::packet::Flags as PacketFlags;
use ffmpeg_next::codec::Id;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::util::frame::video::Video as VideoFrame;
use ffmpeg_next::{media, Packet, Rational};
use tracing::{debug, trace, warn};

use super::{
    Container, DecodeEngine, DecodedImage, Decoder, DecoderInfo, InputSample, InputSlot,
    OutputEvent, OutputSlot, Sample, TrackFormat,
};
use crate::error::{DecodeError, Result};
use crate::protocol::{PixelLayout, PlaneStrides};

const MICROS: Rational = Rational(1, 1_000_000);

/// Decoded frames the decoder may hold before input is refused.
const MAX_IN_FLIGHT: usize = 8;

/// Codec ids with a well-known mime type.
const MIME_TYPES: &[(Id, &str)] = &[
    (Id::H264, "video/avc"),
    (Id::HEVC, "video/hevc"),
    (Id::VP8, "video/x-vnd.on2.vp8"),
    (Id::VP9, "video/x-vnd.on2.vp9"),
    (Id::AV1, "video/av01"),
    (Id::MPEG4, "video/mp4v-es"),
    (Id::MPEG2VIDEO, "video/mpeg2"),
    (Id::PRORES, "video/prores"),
    (Id::AAC, "audio/mp4a-latm"),
    (Id::OPUS, "audio/opus"),
    (Id::MP3, "audio/mpeg"),
];

/// Hardware decoders probed by name: (name, mime, output layout).
const HW_DECODERS: &[(&str, &str, PixelLayout)] = &[
    ("h264_cuvid", "video/avc", PixelLayout::Yuv420SemiPlanar),
    ("hevc_cuvid", "video/hevc", PixelLayout::Yuv420SemiPlanar),
    ("vp9_cuvid", "video/x-vnd.on2.vp9", PixelLayout::Yuv420SemiPlanar),
    ("av1_cuvid", "video/av01", PixelLayout::Yuv420SemiPlanar),
    ("h264_qsv", "video/avc", PixelLayout::Yuv420SemiPlanar),
    ("hevc_qsv", "video/hevc", PixelLayout::Yuv420SemiPlanar),
    ("h264_v4l2m2m", "video/avc", PixelLayout::Yuv420Planar),
    ("hevc_v4l2m2m", "video/hevc", PixelLayout::Yuv420Planar),
];

fn engine_err(context: &str, e: ffmpeg::Error) -> DecodeError {
    DecodeError::Engine(format!("{}: {}", context, e))
}

/// Mime type for a codec, falling back to an `x-ffmpeg-*` name.
pub fn mime_for(id: Id, medium: media::Type) -> String {
    if let Some((_, mime)) = MIME_TYPES.iter().find(|(known, _)| *known == id) {
        return (*mime).to_string();
    }
    let kind = match medium {
        media::Type::Video => "video",
        media::Type::Audio => "audio",
        _ => "application",
    };
    format!("{}/x-ffmpeg-{}", kind, id.name())
}

/// Inverse of [`mime_for`].
pub fn codec_for(mime: &str) -> Option<Id> {
    MIME_TYPES
        .iter()
        .find(|(_, known)| known.eq_ignore_ascii_case(mime))
        .map(|(id, _)| *id)
}

fn layout_of(format: Pixel) -> PixelLayout {
    match format {
        Pixel::YUV420P | Pixel::YUVJ420P => PixelLayout::Yuv420Planar,
        Pixel::NV12 => PixelLayout::Yuv420SemiPlanar,
        _ => PixelLayout::Unknown,
    }
}

fn rescale_to_micros(value: i64, time_base: Rational) -> i64 {
    if time_base.denominator() == 0 {
        return 0;
    }
    let scaled = value as i128 * time_base.numerator() as i128 * 1_000_000
        / time_base.denominator() as i128;
    scaled as i64
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// Temporary file holding the container bytes, removed on drop.
struct SpooledInput {
    path: PathBuf,
}

impl SpooledInput {
    fn write(bytes: &[u8]) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("ms-chunk-{}.bin", uuid::Uuid::new_v4()));
        std::fs::write(&path, bytes)?;
        Ok(Self { path })
    }
}

impl Drop for SpooledInput {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

pub struct FfmpegContainer {
    input: ffmpeg::format::context::Input,
    tracks: Vec<TrackFormat>,
    time_bases: Vec<Rational>,
    selected: Option<usize>,
    current: Option<Packet>,
    eof: bool,
    _spool: SpooledInput,
}

impl FfmpegContainer {
    pub fn open(bytes: Vec<u8>) -> Result<Self> {
        let spool = SpooledInput::write(&bytes)?;
        drop(bytes);

        let input = ffmpeg::format::input(&spool.path)
            .map_err(|e| DecodeError::InvalidContainer(e.to_string()))?;

        let container_duration = input.duration().max(0);
        let mut tracks = Vec::new();
        let mut time_bases = Vec::new();

        for stream in input.streams() {
            let params = stream.parameters();
            let medium = params.medium();
            let time_base = stream.time_base();

            // SAFETY: `params` borrows the stream's AVCodecParameters for this loop body
            let (width, height, raw_format, extradata) = unsafe {
                let p = &*params.as_ptr();
                let extradata = if p.extradata.is_null() || p.extradata_size <= 0 {
                    Vec::new()
                } else {
                    std::slice::from_raw_parts(p.extradata, p.extradata_size as usize).to_vec()
                };
                (p.width.max(0) as u32, p.height.max(0) as u32, p.format, extradata)
            };

            let pixel_layout = if raw_format == ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32
                || raw_format == ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_YUVJ420P as i32
            {
                PixelLayout::Yuv420Planar
            } else if raw_format == ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_NV12 as i32 {
                PixelLayout::Yuv420SemiPlanar
            } else {
                PixelLayout::Unknown
            };

            let fps = stream.avg_frame_rate();
            let frame_rate = if fps.denominator() > 0 && fps.numerator() > 0 {
                (fps.numerator() as f64 / fps.denominator() as f64).round() as u32
            } else {
                0
            };

            let duration_us = if stream.duration() > 0 {
                rescale_to_micros(stream.duration(), time_base)
            } else {
                container_duration
            };

            tracks.push(TrackFormat {
                mime: mime_for(params.id(), medium),
                width,
                height,
                frame_rate,
                duration_us,
                pixel_layout,
                codec_private: extradata,
            });
            time_bases.push(time_base);
        }

        debug!("Opened container with {} streams", tracks.len());

        Ok(Self {
            input,
            tracks,
            time_bases,
            selected: None,
            current: None,
            eof: false,
            _spool: spool,
        })
    }

    /// Read packets until one of the selected stream turns up.
    fn read_next(&mut self) {
        let Some(selected) = self.selected else {
            self.eof = true;
            return;
        };

        while !self.eof {
            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) if packet.stream() == selected => {
                    packet.rescale_ts(self.time_bases[selected], MICROS);
                    self.current = Some(packet);
                    return;
                }
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => self.eof = true,
                Err(e) => {
                    warn!("Demux error, treating as end of stream: {}", e);
                    self.eof = true;
                }
            }
        }
    }
}

impl Container for FfmpegContainer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.tracks.get(index).cloned()
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        if index >= self.tracks.len() {
            return Err(DecodeError::InvalidContainer(format!(
                "stream {} does not exist",
                index
            )));
        }
        self.selected = Some(index);
        self.current = None;
        self.eof = false;
        Ok(())
    }

    fn read_sample(&mut self) -> Option<Sample<'_>> {
        if self.current.is_none() && !self.eof {
            self.read_next();
        }
        let packet = self.current.as_ref()?;
        Some(Sample {
            data: packet.data().unwrap_or(&[]),
            pts_us: packet.pts().or(packet.dts()).unwrap_or(0),
            is_sync: packet.is_key(),
        })
    }

    fn advance(&mut self) -> bool {
        self.current = None;
        if !self.eof {
            self.read_next();
        }
        self.current.is_some()
    }

    fn seek_to(&mut self, timestamp_us: i64) -> Result<()> {
        // Stream -1 seeks in AV_TIME_BASE units, which are microseconds
        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                -1,
                timestamp_us,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD,
            )
        };
        if ret < 0 {
            return Err(engine_err("seek failed", ffmpeg::Error::from(ret)));
        }
        self.current = None;
        self.eof = false;
        trace!("Seeked to {} us", timestamp_us);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

pub struct FfmpegDecoder {
    codec_name: String,
    hardware: bool,
    decoder: Option<ffmpeg::decoder::Video>,
    layout: PixelLayout,
    announced: PixelLayout,
    granted: Option<usize>,
    next_slot: usize,
    ready: VecDeque<VideoFrame>,
    held: Vec<(usize, VideoFrame)>,
    eos_sent: bool,
    drained: bool,
    eos_emitted: bool,
}

impl FfmpegDecoder {
    fn new(codec_name: &str, hardware: bool) -> Self {
        Self {
            codec_name: codec_name.to_string(),
            hardware,
            decoder: None,
            layout: PixelLayout::Unknown,
            announced: PixelLayout::Unknown,
            granted: None,
            next_slot: 0,
            ready: VecDeque::new(),
            held: Vec::new(),
            eos_sent: false,
            drained: false,
            eos_emitted: false,
        }
    }

    fn opened(&mut self) -> Result<&mut ffmpeg::decoder::Video> {
        self.decoder
            .as_mut()
            .ok_or_else(|| DecodeError::Engine(format!("{} is not configured", self.codec_name)))
    }

    /// Pull every frame the decoder has ready.
    fn receive_all(&mut self) -> Result<()> {
        let mut frames = Vec::new();
        let mut drained = false;
        {
            let decoder = self.opened()?;
            loop {
                let mut frame = VideoFrame::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => frames.push(frame),
                    Err(ffmpeg::Error::Eof) => {
                        drained = true;
                        break;
                    }
                    // EAGAIN: needs more input
                    Err(_) => break,
                }
            }
        }
        self.ready.extend(frames);
        self.drained |= drained;
        Ok(())
    }
}

impl Decoder for FfmpegDecoder {
    fn name(&self) -> &str {
        &self.codec_name
    }

    fn is_hardware(&self) -> bool {
        self.hardware
    }

    fn configure(&mut self, format: &TrackFormat) -> Result<()> {
        let codec = ffmpeg::decoder::find_by_name(&self.codec_name).ok_or_else(|| {
            DecodeError::Configuration(format!("decoder {} not found", self.codec_name))
        })?;

        let mut context = ffmpeg::codec::Context::new_with_codec(codec);

        // SAFETY: the context is freshly allocated and not opened yet; FFmpeg
        // takes ownership of the av_mallocz'd extradata and frees it with the context
        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).width = format.width as i32;
            (*raw).height = format.height as i32;
            (*raw).pkt_timebase = ffmpeg::ffi::AVRational {
                num: 1,
                den: 1_000_000,
            };

            if !format.codec_private.is_empty() {
                let size = format.codec_private.len();
                let padded = size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                let buf = ffmpeg::ffi::av_mallocz(padded) as *mut u8;
                if buf.is_null() {
                    return Err(DecodeError::Configuration(
                        "failed to allocate codec extradata".into(),
                    ));
                }
                std::ptr::copy_nonoverlapping(format.codec_private.as_ptr(), buf, size);
                (*raw).extradata = buf;
                (*raw).extradata_size = size as i32;
            }
        }

        let decoder = context
            .decoder()
            .open_as(codec)
            .and_then(|opened| opened.video())
            .map_err(|e| {
                DecodeError::Configuration(format!("failed to open {}: {}", self.codec_name, e))
            })?;

        // Software decoders report their format once the first frame is out
        self.layout = if self.hardware {
            format.pixel_layout
        } else {
            layout_of(decoder.format())
        };
        self.decoder = Some(decoder);
        debug!(
            "Configured {} for {}x{} {}",
            self.codec_name, format.width, format.height, format.mime
        );
        Ok(())
    }

    fn output_layout(&self) -> PixelLayout {
        self.layout
    }

    fn start(&mut self) -> Result<()> {
        self.opened().map(|_| ())
    }

    /// libavcodec decodes synchronously inside `queue_input`, so neither poll
    /// waits: anything decodable is already in `ready` when they are called.
    fn dequeue_input(&mut self, _timeout: Duration) -> Result<Option<InputSlot>> {
        self.opened()?;
        if self.eos_sent || self.ready.len() + self.held.len() >= MAX_IN_FLIGHT {
            return Ok(None);
        }
        let slot = self.next_slot;
        self.next_slot = self.next_slot.wrapping_add(1);
        self.granted = Some(slot);
        Ok(Some(InputSlot(slot)))
    }

    fn queue_input(&mut self, slot: InputSlot, input: InputSample<'_>) -> Result<()> {
        if self.granted != Some(slot.0) {
            return Err(DecodeError::Engine(format!(
                "input slot {} was not granted",
                slot.0
            )));
        }
        self.granted = None;

        match input {
            InputSample::Data(sample) => {
                let mut packet = Packet::copy(sample.data);
                packet.set_pts(Some(sample.pts_us));
                packet.set_dts(None);
                if sample.is_sync {
                    packet.set_flags(PacketFlags::KEY);
                }
                self.opened()?
                    .send_packet(&packet)
                    .map_err(|e| engine_err("send_packet failed", e))?;
            }
            InputSample::EndOfStream => {
                self.opened()?
                    .send_eof()
                    .map_err(|e| engine_err("send_eof failed", e))?;
                self.eos_sent = true;
            }
        }

        self.receive_all()
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<OutputEvent> {
        if self.ready.is_empty() && !self.drained {
            self.receive_all()?;
        }

        if let Some(frame) = self.ready.front() {
            let layout = layout_of(frame.format());
            if layout != self.announced {
                self.announced = layout;
                self.layout = layout;
                return Ok(OutputEvent::FormatChanged(layout));
            }
        }

        if let Some(frame) = self.ready.pop_front() {
            let slot = self.next_slot;
            self.next_slot = self.next_slot.wrapping_add(1);
            self.held.push((slot, frame));
            return Ok(OutputEvent::Frame(OutputSlot(slot)));
        }

        if self.eos_sent && self.drained && !self.eos_emitted {
            self.eos_emitted = true;
            return Ok(OutputEvent::EndOfStream);
        }

        Ok(OutputEvent::TryAgain)
    }

    fn output_image(&self, slot: OutputSlot) -> Result<DecodedImage<'_>> {
        let (_, frame) = self
            .held
            .iter()
            .find(|(s, _)| *s == slot.0)
            .ok_or_else(|| DecodeError::Engine(format!("output slot {} is not held", slot.0)))?;

        let layout = layout_of(frame.format());
        let (planes, strides) = match layout {
            PixelLayout::Yuv420Planar => (
                vec![frame.data(0), frame.data(1), frame.data(2)],
                PlaneStrides::planar(
                    frame.stride(0) as u32,
                    frame.stride(1) as u32,
                    frame.stride(2) as u32,
                ),
            ),
            PixelLayout::Yuv420SemiPlanar => (
                vec![frame.data(0), frame.data(1)],
                PlaneStrides::semi_planar(frame.stride(0) as u32, frame.stride(1) as u32),
            ),
            _ => {
                return Err(DecodeError::Engine(format!(
                    "unsupported output pixel format {:?}",
                    frame.format()
                )))
            }
        };

        Ok(DecodedImage {
            planes,
            strides,
            timestamp_us: frame.pts().unwrap_or(0),
            layout,
        })
    }

    fn release_output(&mut self, slot: OutputSlot) -> Result<()> {
        let pos = self
            .held
            .iter()
            .position(|(s, _)| *s == slot.0)
            .ok_or_else(|| DecodeError::Engine(format!("output slot {} is not held", slot.0)))?;
        self.held.swap_remove(pos);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.opened()?.flush();
        self.ready.clear();
        self.held.clear();
        self.granted = None;
        self.eos_sent = false;
        self.drained = false;
        self.eos_emitted = false;
        Ok(())
    }

    fn stop(&mut self) {
        self.ready.clear();
        self.held.clear();
        self.decoder = None;
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine backed by the system's FFmpeg libraries.
#[derive(Debug)]
pub struct FfmpegEngine {
    hardware: Vec<DecoderInfo>,
}

impl FfmpegEngine {
    /// Initialize FFmpeg and probe which hardware decoders it was built with.
    pub fn new() -> Result<Self> {
        ffmpeg::init().map_err(|e| engine_err("Failed to initialize FFmpeg", e))?;

        let hardware: Vec<DecoderInfo> = HW_DECODERS
            .iter()
            .filter(|(name, _, _)| ffmpeg::decoder::find_by_name(name).is_some())
            .map(|(name, mime, layout)| DecoderInfo {
                name: (*name).to_string(),
                hardware: true,
                mime_types: vec![(*mime).to_string()],
                layouts: vec![*layout],
            })
            .collect();

        debug!(
            "FFmpeg hardware decoders: {:?}",
            hardware.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
        );
        Ok(Self { hardware })
    }
}

impl DecodeEngine for FfmpegEngine {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open_container(&self, bytes: Vec<u8>) -> Result<Box<dyn Container>> {
        Ok(Box::new(FfmpegContainer::open(bytes)?))
    }

    fn decoder_capabilities(&self) -> Vec<DecoderInfo> {
        self.hardware.clone()
    }

    fn create_decoder_by_name(&self, name: &str) -> Result<Box<dyn Decoder>> {
        if ffmpeg::decoder::find_by_name(name).is_none() {
            return Err(DecodeError::Configuration(format!("no decoder named {}", name)));
        }
        let hardware = self.hardware.iter().any(|d| d.name == name);
        Ok(Box::new(FfmpegDecoder::new(name, hardware)))
    }

    fn create_decoder_by_type(&self, mime: &str) -> Result<Box<dyn Decoder>> {
        let codec = codec_for(mime)
            .and_then(ffmpeg::decoder::find)
            .ok_or_else(|| DecodeError::Configuration(format!("no decoder for {}", mime)))?;
        Ok(Box::new(FfmpegDecoder::new(codec.name(), false)))
    }
}
