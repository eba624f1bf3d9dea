//! Scripted engine for session tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    Container, DecodeEngine, DecodedImage, Decoder, DecoderInfo, InputSample, InputSlot,
    OutputEvent, OutputSlot, Sample, TrackFormat,
};
use crate::error::{DecodeError, Result};
use crate::protocol::{PixelLayout, PlaneStrides};

pub const FRAME_INTERVAL_US: i64 = 33_333;
pub const SOFTWARE_DECODER: &str = "mock.sw";
const MAX_IN_FLIGHT: usize = 4;

pub fn video_track(width: u32, height: u32) -> TrackFormat {
    TrackFormat {
        mime: "video/avc".to_string(),
        width,
        height,
        frame_rate: 30,
        duration_us: 0,
        pixel_layout: PixelLayout::Yuv420SemiPlanar,
        codec_private: Vec::new(),
    }
}

pub fn audio_track() -> TrackFormat {
    TrackFormat {
        mime: "audio/mp4a-latm".to_string(),
        width: 0,
        height: 0,
        frame_rate: 0,
        duration_us: 0,
        pixel_layout: PixelLayout::Unknown,
        codec_private: Vec::new(),
    }
}

/// What the mock engine did, for assertions.
#[derive(Debug, Default)]
pub struct MockLog {
    pub created: Vec<String>,
    pub configured_layout: Option<PixelLayout>,
    pub seeks: Vec<i64>,
    pub flushes: usize,
    pub stops: usize,
    pub inputs: usize,
    pub eos_inputs: usize,
}

pub type SharedLog = Arc<Mutex<MockLog>>;

pub struct MockContainer {
    tracks: Vec<TrackFormat>,
    frames: usize,
    cursor: usize,
    sample: [u8; 4],
    log: SharedLog,
}

impl MockContainer {
    pub fn new(tracks: Vec<TrackFormat>, frames: usize) -> Self {
        Self::with_log(tracks, frames, SharedLog::default())
    }

    fn with_log(tracks: Vec<TrackFormat>, frames: usize, log: SharedLog) -> Self {
        Self {
            tracks,
            frames,
            cursor: 0,
            sample: [0; 4],
            log,
        }
    }
}

impl Container for MockContainer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.tracks.get(index).cloned()
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        if index < self.tracks.len() {
            Ok(())
        } else {
            Err(DecodeError::InvalidContainer(format!("no track {}", index)))
        }
    }

    fn read_sample(&mut self) -> Option<Sample<'_>> {
        if self.cursor >= self.frames {
            return None;
        }
        self.sample = [self.cursor as u8; 4];
        Some(Sample {
            data: &self.sample,
            pts_us: self.cursor as i64 * FRAME_INTERVAL_US,
            is_sync: self.cursor == 0,
        })
    }

    fn advance(&mut self) -> bool {
        if self.cursor < self.frames {
            self.cursor += 1;
        }
        self.cursor < self.frames
    }

    fn seek_to(&mut self, timestamp_us: i64) -> Result<()> {
        self.log.lock().seeks.push(timestamp_us);
        // Only frame 0 is a sync sample
        self.cursor = 0;
        Ok(())
    }
}

#[derive(Clone, Copy, Default)]
pub struct DecoderScript {
    pub configure_error: bool,
    /// Fail the output poll once this many frames were output.
    pub fail_after: Option<usize>,
    /// Frames buffered inside the decoder before the first output.
    pub latency: usize,
    /// Never grant input, never produce output.
    pub stall: bool,
}

struct HeldFrame {
    slot: usize,
    pts_us: i64,
    y: Vec<u8>,
    uv: Vec<u8>,
}

pub struct MockDecoder {
    name: String,
    hardware: bool,
    script: DecoderScript,
    log: SharedLog,
    layout: PixelLayout,
    width: usize,
    height: usize,
    started: bool,
    next_slot: usize,
    pending: VecDeque<(usize, i64, u8)>,
    held: Vec<HeldFrame>,
    eos_queued: bool,
    eos_emitted: bool,
    emitted: usize,
}

impl MockDecoder {
    fn new(name: &str, hardware: bool, script: DecoderScript, log: SharedLog) -> Self {
        log.lock().created.push(name.to_string());
        Self {
            name: name.to_string(),
            hardware,
            script,
            log,
            layout: PixelLayout::Unknown,
            width: 0,
            height: 0,
            started: false,
            next_slot: 0,
            pending: VecDeque::new(),
            held: Vec::new(),
            eos_queued: false,
            eos_emitted: false,
            emitted: 0,
        }
    }
}

impl Decoder for MockDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_hardware(&self) -> bool {
        self.hardware
    }

    fn configure(&mut self, format: &TrackFormat) -> Result<()> {
        if self.script.configure_error {
            return Err(DecodeError::Configuration("mock rejects format".into()));
        }
        self.layout = if format.pixel_layout.is_known() {
            format.pixel_layout
        } else {
            PixelLayout::Yuv420SemiPlanar
        };
        self.width = format.width as usize;
        self.height = format.height as usize;
        self.log.lock().configured_layout = Some(format.pixel_layout);
        Ok(())
    }

    fn output_layout(&self) -> PixelLayout {
        self.layout
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn dequeue_input(&mut self, _timeout: Duration) -> Result<Option<InputSlot>> {
        if !self.started {
            return Err(DecodeError::Engine("not started".into()));
        }
        if self.script.stall {
            return Ok(None);
        }
        let in_flight = self.pending.len() + self.held.len();
        if self.eos_queued || in_flight >= MAX_IN_FLIGHT + self.script.latency {
            return Ok(None);
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(Some(InputSlot(slot)))
    }

    fn queue_input(&mut self, slot: InputSlot, input: InputSample<'_>) -> Result<()> {
        match input {
            InputSample::Data(sample) => {
                self.log.lock().inputs += 1;
                self.pending.push_back((slot.0, sample.pts_us, sample.data[0]));
            }
            InputSample::EndOfStream => {
                self.log.lock().eos_inputs += 1;
                self.eos_queued = true;
            }
        }
        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<OutputEvent> {
        if self.script.stall {
            return Ok(OutputEvent::TryAgain);
        }
        if let Some(limit) = self.script.fail_after {
            if self.emitted >= limit {
                return Err(DecodeError::Engine("mock decoder failure".into()));
            }
        }

        let drain = self.eos_queued || self.pending.len() > self.script.latency;
        if drain {
            if let Some((slot, pts_us, tag)) = self.pending.pop_front() {
                let chroma = (self.width / 2) * (self.height / 2) * 2;
                self.held.push(HeldFrame {
                    slot,
                    pts_us,
                    y: vec![tag; self.width * self.height],
                    uv: vec![128; chroma],
                });
                self.emitted += 1;
                return Ok(OutputEvent::Frame(OutputSlot(slot)));
            }
        }

        if self.eos_queued && !self.eos_emitted {
            self.eos_emitted = true;
            return Ok(OutputEvent::EndOfStream);
        }

        Ok(OutputEvent::TryAgain)
    }

    fn output_image(&self, slot: OutputSlot) -> Result<DecodedImage<'_>> {
        let frame = self
            .held
            .iter()
            .find(|f| f.slot == slot.0)
            .ok_or_else(|| DecodeError::Engine("slot not held".into()))?;
        let w = self.width as u32;
        Ok(DecodedImage {
            planes: vec![&frame.y, &frame.uv],
            strides: PlaneStrides::semi_planar(w, w),
            timestamp_us: frame.pts_us,
            layout: self.layout,
        })
    }

    fn release_output(&mut self, slot: OutputSlot) -> Result<()> {
        let before = self.held.len();
        self.held.retain(|f| f.slot != slot.0);
        if self.held.len() == before {
            return Err(DecodeError::Engine("slot not held".into()));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.pending.clear();
        self.held.clear();
        self.eos_queued = false;
        self.eos_emitted = false;
        self.log.lock().flushes += 1;
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
        self.log.lock().stops += 1;
    }
}

/// Engine producing `frames` tiny samples per pass.
#[derive(Clone)]
pub struct MockEngine {
    pub tracks: Vec<TrackFormat>,
    pub frames: usize,
    pub capabilities: Vec<DecoderInfo>,
    pub fail_named: bool,
    pub fail_open: bool,
    pub script: DecoderScript,
    log: SharedLog,
}

impl MockEngine {
    pub fn new(frames: usize) -> Self {
        Self {
            tracks: vec![video_track(8, 4)],
            frames,
            capabilities: Vec::new(),
            fail_named: false,
            fail_open: false,
            script: DecoderScript::default(),
            log: SharedLog::default(),
        }
    }

    pub fn with_tracks(mut self, tracks: Vec<TrackFormat>) -> Self {
        self.tracks = tracks;
        self
    }

    pub fn with_hardware(mut self, name: &str, layouts: &[PixelLayout]) -> Self {
        self.capabilities.push(DecoderInfo {
            name: name.to_string(),
            hardware: true,
            mime_types: vec!["video/avc".to_string()],
            layouts: layouts.to_vec(),
        });
        self
    }

    pub fn with_script(mut self, script: DecoderScript) -> Self {
        self.script = script;
        self
    }

    pub fn log(&self) -> SharedLog {
        self.log.clone()
    }
}

impl DecodeEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn open_container(&self, _bytes: Vec<u8>) -> Result<Box<dyn Container>> {
        if self.fail_open {
            return Err(DecodeError::InvalidContainer("mock cannot open".into()));
        }
        Ok(Box::new(MockContainer::with_log(
            self.tracks.clone(),
            self.frames,
            self.log.clone(),
        )))
    }

    fn decoder_capabilities(&self) -> Vec<DecoderInfo> {
        self.capabilities.clone()
    }

    fn create_decoder_by_name(&self, name: &str) -> Result<Box<dyn Decoder>> {
        if self.fail_named {
            return Err(DecodeError::Configuration(format!("{} unavailable", name)));
        }
        let hardware = self
            .capabilities
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.hardware)
            .ok_or_else(|| DecodeError::Configuration(format!("no decoder {}", name)))?;
        Ok(Box::new(MockDecoder::new(
            name,
            hardware,
            self.script,
            self.log.clone(),
        )))
    }

    fn create_decoder_by_type(&self, mime: &str) -> Result<Box<dyn Decoder>> {
        if !mime.starts_with("video/") {
            return Err(DecodeError::Configuration(format!("no decoder for {}", mime)));
        }
        Ok(Box::new(MockDecoder::new(
            SOFTWARE_DECODER,
            false,
            self.script,
            self.log.clone(),
        )))
    }
}
