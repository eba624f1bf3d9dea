//! YUV4MPEG2 container and raw pass-through decoder
//!
//! Y4M carries uncompressed frames, so the "decoder" only has to split each
//! sample into planes. It still goes through the same slot protocol as a real
//! codec, which makes it the reference engine for the session and the CLI.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::{
    Container, DecodeEngine, DecodedImage, Decoder, DecoderInfo, InputSample, InputSlot,
    OutputEvent, OutputSlot, Sample, TrackFormat,
};
use crate::error::{DecodeError, Result};
use crate::protocol::{PixelLayout, PlaneStrides};

pub const Y4M_MIME: &str = "video/raw";
pub const RAW_DECODER_NAME: &str = "y4m.raw";

const SIGNATURE: &str = "YUV4MPEG2";
const FRAME_TAG: &[u8] = b"FRAME";
const MAX_HEADER_LEN: usize = 1024;

/// Frames the raw decoder holds before refusing more input.
const MAX_IN_FLIGHT: usize = 4;

/// Chroma subsampling declared by the `C` header tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chroma {
    C420,
    C422,
    C444,
    Mono,
}

impl Chroma {
    fn parse(tag: &str) -> Result<Self> {
        match tag {
            "420" | "420jpeg" | "420paldv" | "420mpeg2" => Ok(Self::C420),
            "422" => Ok(Self::C422),
            "444" => Ok(Self::C444),
            "mono" => Ok(Self::Mono),
            other => Err(DecodeError::InvalidContainer(format!(
                "unknown Y4M colorspace C{}",
                other
            ))),
        }
    }

    /// Bytes per frame, `None` if it does not fit in `usize`.
    fn frame_size(self, width: usize, height: usize) -> Option<usize> {
        let luma = width.checked_mul(height)?;
        let cw = half_up(width);
        let ch = half_up(height);
        let chroma = match self {
            Self::C420 => cw.checked_mul(ch)?.checked_mul(2)?,
            Self::C422 => cw.checked_mul(height)?.checked_mul(2)?,
            Self::C444 => luma.checked_mul(2)?,
            Self::Mono => 0,
        };
        luma.checked_add(chroma)
    }

    fn layout(self) -> PixelLayout {
        match self {
            Self::C420 => PixelLayout::Yuv420Planar,
            _ => PixelLayout::Unknown,
        }
    }
}

/// Stream parameters from the Y4M header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Y4mHeader {
    pub width: u32,
    pub height: u32,
    /// Frame rate as `num:den`, absent when the header has no `F` tag.
    pub frame_rate: Option<(u32, u32)>,
    pub chroma: Chroma,
}

impl Y4mHeader {
    fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        let window = &bytes[..bytes.len().min(MAX_HEADER_LEN)];
        let end = window
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| DecodeError::InvalidContainer("Y4M header line not terminated".into()))?;

        let line = std::str::from_utf8(&window[..end])
            .ok()
            .filter(|l| l.is_ascii())
            .ok_or_else(|| DecodeError::InvalidContainer("Y4M header is not ASCII".into()))?;
        let rest = line
            .strip_prefix(SIGNATURE)
            .ok_or_else(|| DecodeError::InvalidContainer("missing YUV4MPEG2 signature".into()))?;

        let mut width = 0u32;
        let mut height = 0u32;
        let mut frame_rate = None;
        let mut chroma = Chroma::C420;

        for token in rest.split_ascii_whitespace() {
            let (key, value) = token.split_at(1);
            match key {
                "W" => width = parse_number(value, "width")?,
                "H" => height = parse_number(value, "height")?,
                "F" => {
                    let (num, den) = value.split_once(':').ok_or_else(|| {
                        DecodeError::InvalidContainer(format!("bad frame rate F{}", value))
                    })?;
                    let num: u32 = parse_number(num, "frame rate")?;
                    let den: u32 = parse_number(den, "frame rate")?;
                    if num > 0 && den > 0 {
                        frame_rate = Some((num, den));
                    }
                }
                "C" => chroma = Chroma::parse(value)?,
                // Interlacing, aspect ratio and extensions do not affect layout
                _ => {}
            }
        }

        if width == 0 || height == 0 {
            return Err(DecodeError::InvalidContainer(format!(
                "invalid Y4M dimensions {}x{}",
                width, height
            )));
        }

        Ok((
            Self {
                width,
                height,
                frame_rate,
                chroma,
            },
            end + 1,
        ))
    }

    pub fn frame_size(&self) -> Result<usize> {
        self.chroma
            .frame_size(self.width as usize, self.height as usize)
            .ok_or_else(|| {
                DecodeError::InvalidContainer(format!(
                    "Y4M frame size for {}x{} overflows",
                    self.width, self.height
                ))
            })
    }

    /// Presentation time of frame `index` in microseconds, saturating at `i64::MAX`.
    pub fn timestamp_us(&self, index: usize) -> i64 {
        let (num, den) = self.frame_rate.unwrap_or((super::DEFAULT_FRAME_RATE, 1));
        let micros = index as u128 * 1_000_000 * den as u128 / num as u128;
        i64::try_from(micros).unwrap_or(i64::MAX)
    }

    fn frame_index_at(&self, timestamp_us: i64) -> usize {
        if timestamp_us <= 0 {
            return 0;
        }
        let (num, den) = self.frame_rate.unwrap_or((super::DEFAULT_FRAME_RATE, 1));
        let index = timestamp_us as u128 * num as u128 / (1_000_000 * den as u128);
        usize::try_from(index).unwrap_or(usize::MAX)
    }
}

fn half_up(n: usize) -> usize {
    n / 2 + n % 2
}

fn parse_number(value: &str, what: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| DecodeError::InvalidContainer(format!("bad Y4M {}: {}", what, value)))
}

/// Demuxer over an in-memory Y4M stream. Every frame is a sync sample.
pub struct Y4mContainer {
    data: Vec<u8>,
    header: Y4mHeader,
    frames: Vec<(usize, usize)>,
    cursor: usize,
}

impl Y4mContainer {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let (header, mut pos) = Y4mHeader::parse(&data)?;
        let frame_size = header.frame_size()?;
        let mut frames = Vec::new();

        while pos < data.len() {
            if !data[pos..].starts_with(FRAME_TAG) {
                return Err(DecodeError::InvalidContainer(format!(
                    "expected FRAME marker at offset {}",
                    pos
                )));
            }
            let line_end = data[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| pos + p)
                .ok_or_else(|| {
                    DecodeError::InvalidContainer(format!("unterminated FRAME at offset {}", pos))
                })?;

            let start = line_end + 1;
            let end = match start.checked_add(frame_size) {
                Some(end) if end <= data.len() => end,
                _ => {
                    warn!(
                        "Dropping truncated Y4M frame {} ({} of {} bytes)",
                        frames.len(),
                        data.len() - start,
                        frame_size
                    );
                    break;
                }
            };

            frames.push((start, frame_size));
            pos = end;
        }

        debug!(
            "Opened Y4M: {}x{} {:?}, {} frames",
            header.width,
            header.height,
            header.chroma,
            frames.len()
        );

        Ok(Self {
            data,
            header,
            frames,
            cursor: 0,
        })
    }

    pub fn header(&self) -> &Y4mHeader {
        &self.header
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl Container for Y4mContainer {
    fn track_count(&self) -> usize {
        1
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        if index != 0 {
            return None;
        }
        let frame_rate = self
            .header
            .frame_rate
            .map(|(num, den)| ((num as f64 / den as f64).round()) as u32)
            .unwrap_or(0);

        Some(TrackFormat {
            mime: Y4M_MIME.to_string(),
            width: self.header.width,
            height: self.header.height,
            frame_rate,
            duration_us: self.header.timestamp_us(self.frames.len()),
            pixel_layout: self.header.chroma.layout(),
            codec_private: Vec::new(),
        })
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        if index == 0 {
            Ok(())
        } else {
            Err(DecodeError::InvalidContainer(format!(
                "Y4M has a single track, not {}",
                index
            )))
        }
    }

    fn read_sample(&mut self) -> Option<Sample<'_>> {
        let &(start, len) = self.frames.get(self.cursor)?;
        Some(Sample {
            data: &self.data[start..start + len],
            pts_us: self.header.timestamp_us(self.cursor),
            is_sync: true,
        })
    }

    fn advance(&mut self) -> bool {
        if self.cursor < self.frames.len() {
            self.cursor += 1;
        }
        self.cursor < self.frames.len()
    }

    fn seek_to(&mut self, timestamp_us: i64) -> Result<()> {
        let index = self.header.frame_index_at(timestamp_us);
        self.cursor = index.min(self.frames.len());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct RawGeometry {
    y_size: usize,
    c_size: usize,
    frame_size: usize,
    strides: PlaneStrides,
}

struct RawFrame {
    slot: usize,
    data: Vec<u8>,
    pts_us: i64,
}

/// Pass-through decoder for planar 4:2:0 samples.
pub struct RawDecoder {
    geometry: Option<RawGeometry>,
    started: bool,
    announced: bool,
    granted: Option<usize>,
    next_slot: usize,
    ready: VecDeque<RawFrame>,
    held: Vec<RawFrame>,
    spare: Vec<Vec<u8>>,
    eos_queued: bool,
    eos_emitted: bool,
}

impl RawDecoder {
    pub fn new() -> Self {
        Self {
            geometry: None,
            started: false,
            announced: false,
            granted: None,
            next_slot: 0,
            ready: VecDeque::new(),
            held: Vec::new(),
            spare: Vec::new(),
            eos_queued: false,
            eos_emitted: false,
        }
    }

    fn ensure_started(&self) -> Result<RawGeometry> {
        match (self.started, self.geometry) {
            (true, Some(g)) => Ok(g),
            _ => Err(DecodeError::Engine("raw decoder not started".into())),
        }
    }

    fn recycle(&mut self, data: Vec<u8>) {
        if self.spare.len() < MAX_IN_FLIGHT {
            self.spare.push(data);
        }
    }

    fn drop_queued(&mut self) {
        let drained: Vec<_> = self.ready.drain(..).chain(self.held.drain(..)).collect();
        for frame in drained {
            self.recycle(frame.data);
        }
        self.granted = None;
        self.eos_queued = false;
        self.eos_emitted = false;
    }
}

impl Default for RawDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RawDecoder {
    fn name(&self) -> &str {
        RAW_DECODER_NAME
    }

    fn configure(&mut self, format: &TrackFormat) -> Result<()> {
        if format.mime != Y4M_MIME {
            return Err(DecodeError::Configuration(format!(
                "{} cannot decode {}",
                RAW_DECODER_NAME, format.mime
            )));
        }
        if format.pixel_layout != PixelLayout::Yuv420Planar {
            return Err(DecodeError::Configuration(format!(
                "{} only outputs YUV420Planar, requested {}",
                RAW_DECODER_NAME,
                format.pixel_layout.display_name()
            )));
        }

        let width = format.width as usize;
        let height = format.height as usize;
        let frame_size = Chroma::C420.frame_size(width, height).ok_or_else(|| {
            DecodeError::Configuration(format!(
                "{}x{} frame does not fit in memory",
                format.width, format.height
            ))
        })?;
        let cw = half_up(width);
        let ch = half_up(height);

        // Both planes are bounded by `frame_size`
        self.geometry = Some(RawGeometry {
            y_size: width * height,
            c_size: cw * ch,
            frame_size,
            strides: PlaneStrides::planar(width as u32, cw as u32, cw as u32),
        });
        Ok(())
    }

    fn output_layout(&self) -> PixelLayout {
        if self.geometry.is_some() {
            PixelLayout::Yuv420Planar
        } else {
            PixelLayout::Unknown
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.geometry.is_none() {
            return Err(DecodeError::Configuration(
                "raw decoder started before configure".into(),
            ));
        }
        self.started = true;
        self.announced = false;
        Ok(())
    }

    /// Never blocks: a slot is free or the caller has to drain output first.
    fn dequeue_input(&mut self, _timeout: Duration) -> Result<Option<InputSlot>> {
        self.ensure_started()?;
        if self.eos_queued || self.ready.len() + self.held.len() >= MAX_IN_FLIGHT {
            return Ok(None);
        }
        let slot = self.next_slot;
        self.next_slot = self.next_slot.wrapping_add(1);
        self.granted = Some(slot);
        Ok(Some(InputSlot(slot)))
    }

    fn queue_input(&mut self, slot: InputSlot, input: InputSample<'_>) -> Result<()> {
        let geometry = self.ensure_started()?;
        if self.granted != Some(slot.0) {
            return Err(DecodeError::Engine(format!(
                "input slot {} was not granted",
                slot.0
            )));
        }
        self.granted = None;

        match input {
            InputSample::Data(sample) => {
                if sample.data.len() != geometry.frame_size {
                    return Err(DecodeError::Engine(format!(
                        "sample is {} bytes, expected {}",
                        sample.data.len(),
                        geometry.frame_size
                    )));
                }
                let mut data = self.spare.pop().unwrap_or_default();
                data.clear();
                data.extend_from_slice(sample.data);
                self.ready.push_back(RawFrame {
                    slot: slot.0,
                    data,
                    pts_us: sample.pts_us,
                });
            }
            InputSample::EndOfStream => self.eos_queued = true,
        }
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputEvent> {
        self.ensure_started()?;

        if !self.announced {
            self.announced = true;
            return Ok(OutputEvent::FormatChanged(PixelLayout::Yuv420Planar));
        }

        if let Some(frame) = self.ready.pop_front() {
            let slot = frame.slot;
            self.held.push(frame);
            return Ok(OutputEvent::Frame(OutputSlot(slot)));
        }

        if self.eos_queued && !self.eos_emitted {
            self.eos_emitted = true;
            return Ok(OutputEvent::EndOfStream);
        }

        // Output only appears when the caller queues input, so just wait out the poll
        if !timeout.is_zero() {
            thread::sleep(timeout);
        }
        Ok(OutputEvent::TryAgain)
    }

    fn output_image(&self, slot: OutputSlot) -> Result<DecodedImage<'_>> {
        let geometry = self.ensure_started()?;
        let frame = self
            .held
            .iter()
            .find(|f| f.slot == slot.0)
            .ok_or_else(|| DecodeError::Engine(format!("output slot {} is not held", slot.0)))?;

        let (y, chroma) = frame.data.split_at(geometry.y_size);
        let (u, v) = chroma.split_at(geometry.c_size);

        Ok(DecodedImage {
            planes: vec![y, u, v],
            strides: geometry.strides,
            timestamp_us: frame.pts_us,
            layout: PixelLayout::Yuv420Planar,
        })
    }

    fn release_output(&mut self, slot: OutputSlot) -> Result<()> {
        let pos = self
            .held
            .iter()
            .position(|f| f.slot == slot.0)
            .ok_or_else(|| DecodeError::Engine(format!("output slot {} is not held", slot.0)))?;
        let frame = self.held.swap_remove(pos);
        self.recycle(frame.data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_started()?;
        self.drop_queued();
        Ok(())
    }

    fn stop(&mut self) {
        self.drop_queued();
        self.spare.clear();
        self.started = false;
    }
}

/// Engine for Y4M input.
#[derive(Debug, Default, Clone, Copy)]
pub struct Y4mEngine;

impl DecodeEngine for Y4mEngine {
    fn name(&self) -> &str {
        "y4m"
    }

    fn open_container(&self, bytes: Vec<u8>) -> Result<Box<dyn Container>> {
        Ok(Box::new(Y4mContainer::parse(bytes)?))
    }

    fn decoder_capabilities(&self) -> Vec<DecoderInfo> {
        vec![DecoderInfo {
            name: RAW_DECODER_NAME.to_string(),
            hardware: false,
            mime_types: vec![Y4M_MIME.to_string()],
            layouts: vec![PixelLayout::Yuv420Planar],
        }]
    }

    fn create_decoder_by_name(&self, name: &str) -> Result<Box<dyn Decoder>> {
        if name == RAW_DECODER_NAME {
            Ok(Box::new(RawDecoder::new()))
        } else {
            Err(DecodeError::Configuration(format!("no decoder named {}", name)))
        }
    }

    fn create_decoder_by_type(&self, mime: &str) -> Result<Box<dyn Decoder>> {
        if mime == Y4M_MIME {
            Ok(Box::new(RawDecoder::new()))
        } else {
            Err(DecodeError::Configuration(format!("no decoder for {}", mime)))
        }
    }
}

/// Writes a planar 4:2:0 Y4M stream.
pub struct Y4mWriter<W: Write> {
    inner: W,
    frame_size: usize,
}

impl<W: Write> Y4mWriter<W> {
    pub fn new(mut inner: W, width: u32, height: u32, fps: u32) -> io::Result<Self> {
        writeln!(
            inner,
            "{} W{} H{} F{}:1 Ip A1:1 C420jpeg",
            SIGNATURE, width, height, fps
        )?;
        let frame_size = Chroma::C420
            .frame_size(width as usize, height as usize)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{}x{} frame size overflows", width, height),
                )
            })?;
        Ok(Self { inner, frame_size })
    }

    pub fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() != self.frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame is {} bytes, expected {}", data.len(), self.frame_size),
            ));
        }
        self.inner.write_all(b"FRAME\n")?;
        self.inner.write_all(data)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Synthetic test pattern: a moving luma gradient whose top-left sample
/// equals the frame index (mod 256).
pub fn synth_stream(width: u32, height: u32, fps: u32, frames: usize) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;

    let mut out = Vec::new();
    let mut writer = match Y4mWriter::new(&mut out, width, height, fps) {
        Ok(w) => w,
        Err(_) => return Vec::new(),
    };
    // The writer has checked that the whole frame fits
    let mut frame = vec![0u8; writer.frame_size()];
    let chroma_len = (frame.len() - w * h) / 2;

    for i in 0..frames {
        for y in 0..h {
            for x in 0..w {
                frame[y * w + x] = (x + y + i) as u8;
            }
        }
        let (_, chroma) = frame.split_at_mut(w * h);
        let (u, v) = chroma.split_at_mut(chroma_len);
        u.fill(128);
        v.fill((i * 4) as u8);

        if writer.write_frame(&frame).is_err() {
            break;
        }
    }

    out
}
