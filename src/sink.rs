//! Completion signals
//!
//! The session reports through a [`CompletionSink`] on its worker thread.
//! Where the signals end up (render loop, async task) is up to the sink; the
//! two provided here forward [`SessionEvent`]s into a channel.

use tracing::trace;

use crate::cache::FrameBuffer;
use crate::error::DecodeError;
use crate::protocol::{StreamInfo, VideoId};

/// Receiver of session signals. Called from the session's worker thread.
pub trait CompletionSink: Send + Sync {
    fn on_initialized(&self, info: &StreamInfo);

    /// One encoded frame. The receiver owns it and should hand it back to the
    /// session's pool once consumed.
    fn on_frame(&self, video_id: VideoId, frame: FrameBuffer);

    fn on_chunk_complete(&self, video_id: VideoId);

    fn on_error(&self, video_id: VideoId, error: &DecodeError);

    /// Single-shot playback ran out of frames.
    fn on_end_of_stream(&self, _video_id: VideoId) {}
}

/// Owned form of a sink signal.
#[derive(Debug)]
pub enum SessionEvent {
    Initialized(StreamInfo),
    Frame { video_id: VideoId, frame: FrameBuffer },
    ChunkComplete(VideoId),
    EndOfStream(VideoId),
    Error {
        video_id: VideoId,
        code: &'static str,
        message: String,
    },
}

impl SessionEvent {
    pub fn video_id(&self) -> VideoId {
        match self {
            Self::Initialized(info) => info.video_id,
            Self::Frame { video_id, .. }
            | Self::Error { video_id, .. }
            | Self::ChunkComplete(video_id)
            | Self::EndOfStream(video_id) => *video_id,
        }
    }

    fn error(video_id: VideoId, error: &DecodeError) -> Self {
        Self::Error {
            video_id,
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// Forwards events into a crossbeam channel, for consumers that poll.
#[derive(Clone)]
pub struct ChannelSink {
    tx: crossbeam::channel::Sender<SessionEvent>,
}

impl ChannelSink {
    pub fn new(tx: crossbeam::channel::Sender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn unbounded() -> (Self, crossbeam::channel::Receiver<SessionEvent>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        (Self::new(tx), rx)
    }

    fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver gone, dropping event");
        }
    }
}

impl CompletionSink for ChannelSink {
    fn on_initialized(&self, info: &StreamInfo) {
        self.emit(SessionEvent::Initialized(info.clone()));
    }

    fn on_frame(&self, video_id: VideoId, frame: FrameBuffer) {
        self.emit(SessionEvent::Frame { video_id, frame });
    }

    fn on_chunk_complete(&self, video_id: VideoId) {
        self.emit(SessionEvent::ChunkComplete(video_id));
    }

    fn on_error(&self, video_id: VideoId, error: &DecodeError) {
        self.emit(SessionEvent::error(video_id, error));
    }

    fn on_end_of_stream(&self, video_id: VideoId) {
        self.emit(SessionEvent::EndOfStream(video_id));
    }
}

/// Forwards events into a tokio channel, for async consumers.
#[derive(Clone)]
pub struct TokioSink {
    tx: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
}

impl TokioSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn unbounded() -> (Self, tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver gone, dropping event");
        }
    }
}

impl CompletionSink for TokioSink {
    fn on_initialized(&self, info: &StreamInfo) {
        self.emit(SessionEvent::Initialized(info.clone()));
    }

    fn on_frame(&self, video_id: VideoId, frame: FrameBuffer) {
        self.emit(SessionEvent::Frame { video_id, frame });
    }

    fn on_chunk_complete(&self, video_id: VideoId) {
        self.emit(SessionEvent::ChunkComplete(video_id));
    }

    fn on_error(&self, video_id: VideoId, error: &DecodeError) {
        self.emit(SessionEvent::error(video_id, error));
    }

    fn on_end_of_stream(&self, video_id: VideoId) {
        self.emit(SessionEvent::EndOfStream(video_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_carries_error_code() {
        let (sink, rx) = ChannelSink::unbounded();
        sink.on_error(VideoId(3), &DecodeError::NoVideoTrack);

        match rx.try_recv().unwrap() {
            SessionEvent::Error {
                video_id,
                code,
                message,
            } => {
                assert_eq!(video_id, VideoId(3));
                assert_eq!(code, "NO_VIDEO_TRACK");
                assert_eq!(message, "No video track found");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn dropped_receiver_is_not_fatal() {
        let (sink, rx) = ChannelSink::unbounded();
        drop(rx);
        sink.on_chunk_complete(VideoId(1));
    }

    #[test]
    fn tokio_sink_forwards_end_of_stream() {
        let (sink, mut rx) = TokioSink::unbounded();
        sink.on_end_of_stream(VideoId(9));
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, SessionEvent::EndOfStream(VideoId(9))));
        assert_eq!(event.video_id(), VideoId(9));
    }
}
