//! Decode session
//!
//! One session per video. It owns the container and decoder handles for the
//! video, pulls compressed samples into the decoder, and turns every decoded
//! image into a wire frame handed to the [`CompletionSink`]. Decoding happens
//! in chunks of at most N frames requested by the consumer; between chunks
//! the session sits idle in `AwaitingRequest`.
//!
//! The most recently decoded frame is held back until the session knows what
//! follows it, so the last frame of a pass can carry the end-of-stream flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{BufferPool, FrameBuffer, SharedBufferPool};
use crate::config::{PlaybackMode, SessionConfig};
use crate::decoder::{
    extract_format, rank_decoders, select_video_track, Container, DecodeEngine, Decoder,
    InputSample, OutputEvent, OutputSlot, TrackFormat,
};
use crate::error::{DecodeError, Result};
use crate::protocol::{encode_frame, mark_end_of_stream, StreamInfo, VideoId, WireFormat};
use crate::sink::CompletionSink;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Decoding,
    AwaitingRequest,
    Draining,
    Released,
    Error,
}

/// "A chunk is in flight", shared between the caller-side handle and the
/// worker. Set by whoever requests a chunk, cleared by the worker when the
/// chunk ends either way.
#[derive(Debug, Clone, Default)]
pub struct BusyFlag(Arc<AtomicBool>);

impl BusyFlag {
    /// Set the flag. Returns false if it was already set.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_delivered: u64,
    pub chunks_completed: u64,
    pub loop_restarts: u64,
    /// Frames delivered with the end-of-stream flag set.
    pub eos_frames: u64,
}

/// What one chunk produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub frames: u32,
    /// Single-shot playback reached the end of the stream during this chunk.
    pub end_of_stream: bool,
}

/// Open handles of an initialized session.
struct Pipeline {
    container: Box<dyn Container>,
    decoder: Box<dyn Decoder>,
    info: StreamInfo,
    input_exhausted: bool,
    decoded_since_restart: u64,
    /// Lookahead frame, encoded but not delivered yet.
    held: Option<FrameBuffer>,
}

impl Pipeline {
    /// Submit one sample, or the end-of-stream marker, if the decoder has room.
    fn feed_input(&mut self, timeout: Duration) -> Result<bool> {
        let Some(slot) = self.decoder.dequeue_input(timeout)? else {
            return Ok(false);
        };

        let queued = match self.container.read_sample() {
            Some(sample) => {
                self.decoder.queue_input(slot, InputSample::Data(sample))?;
                true
            }
            None => false,
        };

        if queued {
            self.container.advance();
        } else {
            self.decoder.queue_input(slot, InputSample::EndOfStream)?;
            self.input_exhausted = true;
            debug!("{}: input exhausted", self.info.video_id);
        }
        Ok(true)
    }

    /// Copy a decoded image into a pooled wire frame and give the slot back.
    fn encode_output(
        &mut self,
        slot: OutputSlot,
        pool: &BufferPool,
        format: WireFormat,
    ) -> Result<FrameBuffer> {
        let encoded = self.decoder.output_image(slot).and_then(|image| {
            encode_frame(
                pool,
                &image.planes,
                image.timestamp_us,
                image.strides,
                false,
                format,
            )
        });
        let released = self.decoder.release_output(slot);

        match (encoded, released) {
            (Ok(buffer), Ok(())) => Ok(buffer),
            (Ok(buffer), Err(e)) => {
                pool.release(buffer);
                Err(e)
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Back to the first sync sample with an empty decoder.
    fn restart(&mut self) -> Result<()> {
        self.container.seek_to(0)?;
        self.decoder.flush()?;
        self.input_exhausted = false;
        self.decoded_since_restart = 0;
        Ok(())
    }

    fn close(mut self, pool: &BufferPool) {
        if let Some(buffer) = self.held.take() {
            pool.release(buffer);
        }
        self.decoder.stop();
    }
}

/// Chunked decoder for one video.
///
/// Methods take `&mut self`; the [`SessionHandle`](crate::worker::SessionHandle)
/// runs a session on its own thread and is the usual way in.
pub struct DecodeSession {
    video_id: VideoId,
    engine: Box<dyn DecodeEngine>,
    sink: Arc<dyn CompletionSink>,
    config: SessionConfig,
    pool: SharedBufferPool,
    busy: BusyFlag,
    stats: Arc<Mutex<SessionStats>>,
    state: SessionState,
    pipeline: Option<Pipeline>,
    /// Single-shot playback has delivered its last frame.
    finished: bool,
}

impl DecodeSession {
    pub fn new(
        video_id: VideoId,
        engine: Box<dyn DecodeEngine>,
        sink: Arc<dyn CompletionSink>,
        config: SessionConfig,
    ) -> Self {
        let pool = Arc::new(BufferPool::new(config.pool_capacity, config.stale_policy));
        Self {
            video_id,
            engine,
            sink,
            config,
            pool,
            busy: BusyFlag::default(),
            stats: Arc::new(Mutex::new(SessionStats::default())),
            state: SessionState::Uninitialized,
            pipeline: None,
            finished: false,
        }
    }

    pub fn video_id(&self) -> VideoId {
        self.video_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn info(&self) -> Option<&StreamInfo> {
        self.pipeline.as_ref().map(|p| &p.info)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Pool frames are drawn from. Consumers return buffers here.
    pub fn pool(&self) -> SharedBufferPool {
        self.pool.clone()
    }

    pub fn busy_flag(&self) -> BusyFlag {
        self.busy.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }

    pub(crate) fn shared_stats(&self) -> Arc<Mutex<SessionStats>> {
        self.stats.clone()
    }

    /// Open `bytes` as a container and get a decoder running on its video track.
    ///
    /// Emits `on_initialized` on success, `on_error` otherwise. A failed
    /// session stays in `Error`; nothing opened along the way is kept.
    pub fn initialize(&mut self, bytes: Vec<u8>) -> Result<StreamInfo> {
        if self.state != SessionState::Uninitialized {
            let err = DecodeError::NotInitialized(self.state);
            self.sink.on_error(self.video_id, &err);
            return Err(err);
        }

        self.state = SessionState::Initializing;
        debug!("{}: opening {} byte container", self.video_id, bytes.len());

        match self.open(bytes) {
            Ok(pipeline) => {
                let info = pipeline.info.clone();
                self.pipeline = Some(pipeline);
                self.state = SessionState::Ready;
                info!(
                    "{}: {}x{} @ {} fps, {} us, {} via {}{}",
                    self.video_id,
                    info.width,
                    info.height,
                    info.frame_rate,
                    info.duration_us,
                    info.pixel_layout.display_name(),
                    info.decoder,
                    if info.hw_accel { " (hw)" } else { "" }
                );
                self.sink.on_initialized(&info);
                Ok(info)
            }
            Err(e) => {
                warn!("{}: initialization failed: {}", self.video_id, e);
                self.state = SessionState::Error;
                self.sink.on_error(self.video_id, &e);
                Err(e)
            }
        }
    }

    fn open(&self, bytes: Vec<u8>) -> Result<Pipeline> {
        let mut container = self.engine.open_container(bytes)?;
        let track = select_video_track(container.as_ref())?;
        container.select_track(track)?;
        let format = extract_format(container.as_ref(), track)?;

        let mut decoder = self.create_decoder(&format)?;
        if let Err(e) = decoder.start() {
            decoder.stop();
            return Err(e);
        }

        let reported = decoder.output_layout();
        let pixel_layout = if reported.is_known() {
            reported
        } else {
            format.pixel_layout
        };

        let info = StreamInfo {
            video_id: self.video_id,
            mime: format.mime.clone(),
            frame_rate: format.frame_rate,
            width: format.width,
            height: format.height,
            pixel_layout,
            duration_us: format.duration_us,
            decoder: decoder.name().to_string(),
            hw_accel: decoder.is_hardware(),
        };

        Ok(Pipeline {
            container,
            decoder,
            info,
            input_exhausted: false,
            decoded_since_restart: 0,
            held: None,
        })
    }

    /// Hardware decoders with a usable layout first, then the engine default.
    fn create_decoder(&self, format: &TrackFormat) -> Result<Box<dyn Decoder>> {
        let candidates = rank_decoders(&self.engine.decoder_capabilities(), &format.mime);

        for candidate in candidates {
            let mut decoder = match self.engine.create_decoder_by_name(&candidate.name) {
                Ok(decoder) => decoder,
                Err(e) => {
                    warn!(
                        "{}: hardware decoder {} unavailable: {}",
                        self.video_id, candidate.name, e
                    );
                    continue;
                }
            };

            let mut requested = format.clone();
            requested.pixel_layout = candidate.layout;
            match decoder.configure(&requested) {
                Ok(()) => {
                    debug!(
                        "{}: using {} with {}",
                        self.video_id,
                        candidate.name,
                        candidate.layout.display_name()
                    );
                    return Ok(decoder);
                }
                Err(e) => {
                    warn!(
                        "{}: {} rejected the track: {}",
                        self.video_id, candidate.name, e
                    );
                    decoder.stop();
                }
            }
        }

        debug!("{}: using default decoder for {}", self.video_id, format.mime);
        let mut decoder = self.engine.create_decoder_by_type(&format.mime)?;
        if let Err(e) = decoder.configure(format) {
            decoder.stop();
            return Err(e);
        }
        Ok(decoder)
    }

    /// Decode up to `max_frames` frames on the calling thread.
    ///
    /// Returns `AlreadyBusy` without touching the sink if a chunk is already
    /// claimed.
    pub fn decode_chunk(&mut self, max_frames: u32) -> Result<ChunkOutcome> {
        if !self.busy.try_claim() {
            debug!("{}: chunk already in flight, ignoring request", self.video_id);
            return Err(DecodeError::AlreadyBusy);
        }
        self.run_claimed_chunk(max_frames)
    }

    /// Run a chunk whose busy flag the caller already set.
    pub(crate) fn run_claimed_chunk(&mut self, max_frames: u32) -> Result<ChunkOutcome> {
        let result = self.run_chunk(max_frames);

        if result.is_err() && self.state == SessionState::Decoding {
            self.state = SessionState::Error;
        }
        self.busy.clear();

        match &result {
            Ok(outcome) => {
                self.stats.lock().chunks_completed += 1;
                if outcome.end_of_stream {
                    self.sink.on_end_of_stream(self.video_id);
                }
                self.sink.on_chunk_complete(self.video_id);
            }
            Err(e) => {
                warn!("{}: chunk failed: {}", self.video_id, e);
                self.sink.on_error(self.video_id, e);
            }
        }
        result
    }

    fn run_chunk(&mut self, max_frames: u32) -> Result<ChunkOutcome> {
        match self.state {
            SessionState::Ready | SessionState::AwaitingRequest => {}
            state => return Err(DecodeError::NotInitialized(state)),
        }

        if max_frames == 0 || self.finished {
            self.state = SessionState::AwaitingRequest;
            return Ok(ChunkOutcome {
                frames: 0,
                end_of_stream: false,
            });
        }

        self.state = SessionState::Decoding;
        let outcome = self.decode_frames(max_frames)?;
        self.state = SessionState::AwaitingRequest;

        debug!(
            "{}: chunk done, {} frames{}",
            self.video_id,
            outcome.frames,
            if outcome.end_of_stream { ", end of stream" } else { "" }
        );
        Ok(outcome)
    }

    fn decode_frames(&mut self, budget: u32) -> Result<ChunkOutcome> {
        let poll = self.config.poll_timeout();
        let stall = self.config.stall_timeout();
        let wire = self.config.wire_format;
        let mode = self.config.playback_mode;
        let video_id = self.video_id;

        let state = self.state;
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or(DecodeError::NotInitialized(state))?;

        let mut delivered = 0u32;
        let mut last_progress = Instant::now();

        while delivered < budget {
            let mut progressed = false;

            if !pipeline.input_exhausted {
                progressed |= pipeline.feed_input(poll)?;
            }

            match pipeline.decoder.dequeue_output(poll)? {
                OutputEvent::TryAgain => {}
                OutputEvent::FormatChanged(layout) => {
                    progressed = true;
                    if layout.is_known() && layout != pipeline.info.pixel_layout {
                        debug!(
                            "{}: decoder output is now {}",
                            video_id,
                            layout.display_name()
                        );
                        pipeline.info.pixel_layout = layout;
                    }
                }
                OutputEvent::Frame(slot) => {
                    progressed = true;
                    let frame = pipeline.encode_output(slot, &self.pool, wire)?;
                    pipeline.decoded_since_restart += 1;
                    if let Some(previous) = pipeline.held.replace(frame) {
                        self.sink.on_frame(video_id, previous);
                        self.stats.lock().frames_delivered += 1;
                        delivered += 1;
                    }
                }
                OutputEvent::EndOfStream => {
                    progressed = true;
                    if pipeline.decoded_since_restart == 0 {
                        return Err(DecodeError::Engine(
                            "end of stream reached without a decoded frame".into(),
                        ));
                    }

                    if let Some(mut last) = pipeline.held.take() {
                        mark_end_of_stream(&mut last, wire);
                        self.sink.on_frame(video_id, last);
                        let mut stats = self.stats.lock();
                        stats.frames_delivered += 1;
                        stats.eos_frames += 1;
                        delivered += 1;
                    }

                    match mode {
                        PlaybackMode::Loop => {
                            pipeline.restart()?;
                            self.stats.lock().loop_restarts += 1;
                            debug!("{}: looping back to start", video_id);
                        }
                        PlaybackMode::SingleShot => {
                            self.finished = true;
                            info!("{}: end of stream", video_id);
                            return Ok(ChunkOutcome {
                                frames: delivered,
                                end_of_stream: true,
                            });
                        }
                    }
                }
            }

            if progressed {
                last_progress = Instant::now();
            } else if last_progress.elapsed() >= stall {
                return Err(DecodeError::Engine(format!(
                    "decoder stalled for {} ms",
                    stall.as_millis()
                )));
            }
        }

        Ok(ChunkOutcome {
            frames: delivered,
            end_of_stream: false,
        })
    }

    /// Stop the decoder, close the container and drop pooled buffers.
    ///
    /// Safe to call more than once. The lookahead frame, if any, is never
    /// delivered.
    pub fn release(&mut self) {
        if self.state == SessionState::Released {
            return;
        }

        self.state = SessionState::Draining;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.close(&self.pool);
        }
        self.pool.clear();
        self.busy.clear();
        self.state = SessionState::Released;

        let stats = self.stats.lock().clone();
        info!(
            "{}: released after {} frames in {} chunks",
            self.video_id, stats.frames_delivered, stats.chunks_completed
        );
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::mock::{
        audio_track, video_track, DecoderScript, MockEngine, FRAME_INTERVAL_US, SOFTWARE_DECODER,
    };
    use crate::protocol::{FrameHeader, PixelLayout};
    use crate::sink::{ChannelSink, SessionEvent};
    use crossbeam::channel::Receiver;

    fn session(engine: MockEngine, config: SessionConfig) -> (DecodeSession, Receiver<SessionEvent>) {
        let (sink, events) = ChannelSink::unbounded();
        let session = DecodeSession::new(VideoId(1), Box::new(engine), Arc::new(sink), config);
        (session, events)
    }

    fn frame_headers(events: &Receiver<SessionEvent>, pool: &BufferPool) -> Vec<FrameHeader> {
        events
            .try_iter()
            .filter_map(|event| match event {
                SessionEvent::Frame { frame, .. } => {
                    let header = FrameHeader::parse(frame.as_bytes(), WireFormat::Standard).unwrap();
                    pool.release(frame);
                    Some(header)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn initialize_reports_stream_info() {
        let (mut session, events) = session(MockEngine::new(10), SessionConfig::default());
        let info = session.initialize(Vec::new()).unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(info.width, 8);
        assert_eq!(info.frame_rate, 30);
        assert_eq!(info.decoder, SOFTWARE_DECODER);
        assert!(!info.hw_accel);
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Initialized(i) if i == info
        ));
    }

    #[test]
    fn no_video_track_errors_without_initialized() {
        let engine = MockEngine::new(10).with_tracks(vec![audio_track()]);
        let (mut session, events) = session(engine, SessionConfig::default());

        assert!(matches!(
            session.initialize(Vec::new()),
            Err(DecodeError::NoVideoTrack)
        ));
        assert_eq!(session.state(), SessionState::Error);

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert!(matches!(
            &received[0],
            SessionEvent::Error { code, .. } if *code == "NO_VIDEO_TRACK"
        ));
    }

    #[test]
    fn hardware_decoder_preferred() {
        let engine = MockEngine::new(10).with_hardware("mock.hw", &[PixelLayout::Yuv420Planar]);
        let log = engine.log();
        let (mut session, _events) = session(engine, SessionConfig::default());

        let info = session.initialize(Vec::new()).unwrap();
        assert_eq!(info.decoder, "mock.hw");
        assert!(info.hw_accel);
        assert_eq!(info.pixel_layout, PixelLayout::Yuv420Planar);
        assert_eq!(log.lock().configured_layout, Some(PixelLayout::Yuv420Planar));
    }

    #[test]
    fn hardware_without_usable_layout_falls_back() {
        let engine = MockEngine::new(10).with_hardware("mock.hw", &[PixelLayout::Unknown]);
        let log = engine.log();
        let (mut session, _events) = session(engine, SessionConfig::default());

        let info = session.initialize(Vec::new()).unwrap();
        assert_eq!(info.decoder, SOFTWARE_DECODER);
        assert_eq!(log.lock().created, vec![SOFTWARE_DECODER.to_string()]);
    }

    #[test]
    fn failed_hardware_creation_falls_back() {
        let mut engine = MockEngine::new(10).with_hardware("mock.hw", &[PixelLayout::Yuv420Planar]);
        engine.fail_named = true;
        let (mut session, _events) = session(engine, SessionConfig::default());

        let info = session.initialize(Vec::new()).unwrap();
        assert_eq!(info.decoder, SOFTWARE_DECODER);
    }

    #[test]
    fn unknown_layout_resolved_by_decoder() {
        let mut track = video_track(8, 4);
        track.pixel_layout = PixelLayout::Unknown;
        let engine = MockEngine::new(10).with_tracks(vec![track]);
        let (mut session, _events) = session(engine, SessionConfig::default());

        let info = session.initialize(Vec::new()).unwrap();
        assert_eq!(info.pixel_layout, PixelLayout::Yuv420SemiPlanar);
    }

    #[test]
    fn configure_failure_is_terminal() {
        let engine = MockEngine::new(10).with_script(DecoderScript {
            configure_error: true,
            ..Default::default()
        });
        let (mut session, events) = session(engine, SessionConfig::default());

        assert!(matches!(
            session.initialize(Vec::new()),
            Err(DecodeError::Configuration(_))
        ));
        assert!(matches!(
            session.decode_chunk(5),
            Err(DecodeError::NotInitialized(SessionState::Error))
        ));

        let codes: Vec<_> = events
            .try_iter()
            .filter_map(|e| match e {
                SessionEvent::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(codes, vec!["CONFIGURATION_ERROR", "NOT_INITIALIZED"]);
    }

    #[test]
    fn rejected_decoders_are_stopped() {
        let engine = MockEngine::new(10)
            .with_hardware("mock.hw", &[PixelLayout::Yuv420Planar])
            .with_script(DecoderScript {
                configure_error: true,
                ..Default::default()
            });
        let log = engine.log();
        let (mut session, _events) = session(engine, SessionConfig::default());

        assert!(session.initialize(Vec::new()).is_err());
        let log = log.lock();
        assert_eq!(
            log.created,
            vec!["mock.hw".to_string(), SOFTWARE_DECODER.to_string()]
        );
        assert_eq!(log.stops, 2);
    }

    #[test]
    fn chunk_before_initialize_names_state() {
        let (mut session, _events) = session(MockEngine::new(10), SessionConfig::default());
        assert!(matches!(
            session.decode_chunk(1),
            Err(DecodeError::NotInitialized(SessionState::Uninitialized))
        ));
        assert!(!session.busy_flag().is_busy());
    }

    #[test]
    fn chunk_delivers_exact_budget() {
        let (mut session, events) = session(MockEngine::new(100), SessionConfig::default());
        session.initialize(Vec::new()).unwrap();

        let outcome = session.decode_chunk(7).unwrap();
        assert_eq!(outcome.frames, 7);
        assert_eq!(session.state(), SessionState::AwaitingRequest);

        let pool = session.pool();
        let headers = frame_headers(&events, &pool);
        let timestamps: Vec<_> = headers.iter().map(|h| h.timestamp_us).collect();
        let expected: Vec<_> = (0..7).map(|i| i * FRAME_INTERVAL_US).collect();
        assert_eq!(timestamps, expected);
        assert!(headers.iter().all(|h| !h.end_of_stream));
    }

    #[test]
    fn chunk_complete_follows_frames() {
        let (mut session, events) = session(MockEngine::new(100), SessionConfig::default());
        session.initialize(Vec::new()).unwrap();
        session.decode_chunk(3).unwrap();

        let kinds: Vec<_> = events
            .try_iter()
            .map(|e| match e {
                SessionEvent::Initialized(_) => "init",
                SessionEvent::Frame { .. } => "frame",
                SessionEvent::ChunkComplete(_) => "complete",
                SessionEvent::EndOfStream(_) => "eos",
                SessionEvent::Error { .. } => "error",
            })
            .collect();
        assert_eq!(kinds, vec!["init", "frame", "frame", "frame", "complete"]);
    }

    #[test]
    fn loop_restart_within_one_chunk() {
        let engine = MockEngine::new(5);
        let log = engine.log();
        let (mut session, events) = session(engine, SessionConfig::default());
        session.initialize(Vec::new()).unwrap();

        assert_eq!(session.decode_chunk(8).unwrap().frames, 8);

        let pool = session.pool();
        let headers = frame_headers(&events, &pool);
        assert_eq!(headers.len(), 8);

        let flagged: Vec<_> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.end_of_stream)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flagged, vec![4]);
        assert_eq!(headers[4].timestamp_us, 4 * FRAME_INTERVAL_US);
        assert_eq!(headers[5].timestamp_us, 0);

        assert_eq!(log.lock().seeks, vec![0]);
        assert_eq!(log.lock().flushes, 1);
        assert_eq!(session.stats().loop_restarts, 1);
        assert_eq!(session.stats().eos_frames, 1);
    }

    #[test]
    fn consecutive_chunks_continue_the_stream() {
        let (mut session, events) = session(MockEngine::new(50), SessionConfig::default());
        session.initialize(Vec::new()).unwrap();
        let pool = session.pool();

        session.decode_chunk(4).unwrap();
        let first = frame_headers(&events, &pool);
        session.decode_chunk(4).unwrap();
        let second = frame_headers(&events, &pool);

        assert_eq!(first.last().unwrap().timestamp_us, 3 * FRAME_INTERVAL_US);
        assert_eq!(second[0].timestamp_us, 4 * FRAME_INTERVAL_US);
        assert_eq!(session.stats().chunks_completed, 2);
        assert_eq!(session.stats().frames_delivered, 8);
    }

    #[test]
    fn decoder_latency_does_not_change_budget() {
        let engine = MockEngine::new(30).with_script(DecoderScript {
            latency: 3,
            ..Default::default()
        });
        let (mut session, events) = session(engine, SessionConfig::default());
        session.initialize(Vec::new()).unwrap();

        assert_eq!(session.decode_chunk(10).unwrap().frames, 10);
        let pool = session.pool();
        assert_eq!(frame_headers(&events, &pool).len(), 10);
    }

    #[test]
    fn single_shot_ends_early() {
        let config = SessionConfig::default().with_playback_mode(PlaybackMode::SingleShot);
        let (mut session, events) = session(MockEngine::new(5), config);
        session.initialize(Vec::new()).unwrap();

        let outcome = session.decode_chunk(10).unwrap();
        assert_eq!(
            outcome,
            ChunkOutcome {
                frames: 5,
                end_of_stream: true
            }
        );

        let tail: Vec<_> = events
            .try_iter()
            .filter(|e| !matches!(e, SessionEvent::Frame { .. } | SessionEvent::Initialized(_)))
            .collect();
        assert!(matches!(tail[0], SessionEvent::EndOfStream(VideoId(1))));
        assert!(matches!(tail[1], SessionEvent::ChunkComplete(VideoId(1))));

        let again = session.decode_chunk(10).unwrap();
        assert_eq!(again.frames, 0);
        assert!(!again.end_of_stream);
    }

    #[test]
    fn zero_frame_chunk_completes() {
        let (mut session, events) = session(MockEngine::new(5), SessionConfig::default());
        session.initialize(Vec::new()).unwrap();
        let _ = events.try_recv();

        assert_eq!(session.decode_chunk(0).unwrap().frames, 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::ChunkComplete(_)
        ));
    }

    #[test]
    fn empty_stream_fails_instead_of_looping() {
        let (mut session, _events) = session(MockEngine::new(0), SessionConfig::default());
        session.initialize(Vec::new()).unwrap();

        assert!(matches!(session.decode_chunk(3), Err(DecodeError::Engine(_))));
        assert_eq!(session.state(), SessionState::Error);
        assert!(!session.busy_flag().is_busy());
    }

    #[test]
    fn decode_failure_aborts_chunk() {
        let engine = MockEngine::new(20).with_script(DecoderScript {
            fail_after: Some(3),
            ..Default::default()
        });
        let (mut session, events) = session(engine, SessionConfig::default());
        session.initialize(Vec::new()).unwrap();

        assert!(matches!(session.decode_chunk(10), Err(DecodeError::Engine(_))));
        assert_eq!(session.state(), SessionState::Error);
        assert!(!session.busy_flag().is_busy());
        assert!(events
            .try_iter()
            .any(|e| matches!(e, SessionEvent::Error { code, .. } if code == "DECODE_ENGINE_ERROR")));

        assert!(matches!(
            session.decode_chunk(1),
            Err(DecodeError::NotInitialized(SessionState::Error))
        ));
    }

    #[test]
    fn stalled_decoder_fails_chunk() {
        let engine = MockEngine::new(20).with_script(DecoderScript {
            stall: true,
            ..Default::default()
        });
        let config = SessionConfig {
            stall_timeout_ms: 20,
            poll_timeout_us: 100,
            ..Default::default()
        };
        let (mut session, _events) = session(engine, config);
        session.initialize(Vec::new()).unwrap();

        let err = session.decode_chunk(2).unwrap_err();
        assert!(err.to_string().contains("stalled"));
        assert!(!session.busy_flag().is_busy());
    }

    #[test]
    fn claimed_flag_absorbs_request() {
        let (mut session, events) = session(MockEngine::new(5), SessionConfig::default());
        session.initialize(Vec::new()).unwrap();
        let _ = events.try_recv();

        assert!(session.busy_flag().try_claim());
        assert!(matches!(session.decode_chunk(2), Err(DecodeError::AlreadyBusy)));
        // Absorbed silently
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn release_stops_decoder_and_clears_pool() {
        let engine = MockEngine::new(20);
        let log = engine.log();
        let (mut session, events) = session(engine, SessionConfig::default());
        session.initialize(Vec::new()).unwrap();
        session.decode_chunk(3).unwrap();

        let pool = session.pool();
        let _ = frame_headers(&events, &pool);
        assert!(!pool.is_empty());

        session.release();
        assert_eq!(session.state(), SessionState::Released);
        assert!(pool.is_empty());
        assert_eq!(log.lock().stops, 1);

        session.release();
        assert_eq!(log.lock().stops, 1);
    }

    #[test]
    fn double_initialize_is_rejected() {
        let (mut session, _events) = session(MockEngine::new(5), SessionConfig::default());
        session.initialize(Vec::new()).unwrap();
        assert!(matches!(
            session.initialize(Vec::new()),
            Err(DecodeError::NotInitialized(SessionState::Ready))
        ));
        assert_eq!(session.state(), SessionState::Ready);
    }
}
