//! Session worker thread
//!
//! A [`SessionHandle`] owns one decode thread. Commands are posted over a
//! crossbeam channel and executed in order; results come back through the
//! session's [`CompletionSink`]. A redundant `decode_chunk` is dropped on the
//! caller's side, before it reaches the queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::cache::{FrameBuffer, SharedBufferPool};
use crate::config::SessionConfig;
use crate::decoder::DecodeEngine;
use crate::error::{DecodeError, Result};
use crate::protocol::VideoId;
use crate::session::{BusyFlag, DecodeSession, SessionStats};
use crate::sink::CompletionSink;

/// Commands sent from the handle to the decode thread.
enum SessionCommand {
    /// Open the container and start a decoder.
    Initialize(Vec<u8>),
    /// Decode up to N frames. The busy flag is already claimed.
    DecodeChunk(u32),
    /// Release everything and shut the thread down.
    Release,
}

/// Caller-side handle of a session running on its own thread.
pub struct SessionHandle {
    video_id: VideoId,
    cmd_tx: Sender<SessionCommand>,
    busy: BusyFlag,
    pool: SharedBufferPool,
    stats: Arc<Mutex<SessionStats>>,
    thread: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Start the decode thread for `video_id`.
    pub fn spawn(
        video_id: VideoId,
        engine: Box<dyn DecodeEngine>,
        sink: Arc<dyn CompletionSink>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let session = DecodeSession::new(video_id, engine, sink, config);
        let busy = session.busy_flag();
        let pool = session.pool();
        let stats = session.shared_stats();

        let (cmd_tx, cmd_rx) = channel::unbounded::<SessionCommand>();

        let thread = thread::Builder::new()
            .name(format!("decode-{}", video_id))
            .spawn(move || session_thread_main(session, cmd_rx))?;

        debug!("{}: decode thread started", video_id);

        Ok(Self {
            video_id,
            cmd_tx,
            busy,
            pool,
            stats,
            thread: Some(thread),
        })
    }

    pub fn video_id(&self) -> VideoId {
        self.video_id
    }

    /// Queue container initialization. Completion arrives as `on_initialized`
    /// or `on_error`.
    pub fn initialize(&self, video_bytes: Vec<u8>) -> Result<()> {
        self.post(SessionCommand::Initialize(video_bytes))
    }

    /// Request up to `max_frames` frames.
    ///
    /// Returns `Ok(false)` when a chunk is still in flight; the request is
    /// dropped and no signal is emitted for it.
    pub fn decode_chunk(&self, max_frames: u32) -> Result<bool> {
        if !self.busy.try_claim() {
            debug!(
                "{}: decode_chunk({}) ignored, chunk in flight",
                self.video_id, max_frames
            );
            return Ok(false);
        }

        if let Err(e) = self.post(SessionCommand::DecodeChunk(max_frames)) {
            self.busy.clear();
            return Err(e);
        }
        Ok(true)
    }

    /// Whether a chunk is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    /// Hand a consumed frame back for reuse.
    pub fn release_buffer(&self, buffer: FrameBuffer) {
        self.pool.release(buffer);
    }

    pub fn pool(&self) -> SharedBufferPool {
        self.pool.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }

    /// Release the session and join its thread.
    ///
    /// Waits for a chunk in flight to finish first. Later commands fail with
    /// `WorkerGone`.
    pub fn release(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        // The thread may already be gone if it panicked
        let _ = self.cmd_tx.send(SessionCommand::Release);
        if thread.join().is_err() {
            error!("{}: decode thread panicked", self.video_id);
        }
    }

    fn post(&self, command: SessionCommand) -> Result<()> {
        if self.thread.is_none() {
            return Err(DecodeError::WorkerGone);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| DecodeError::WorkerGone)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("video_id", &self.video_id)
            .field("busy", &self.busy.is_busy())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Decode thread
// ---------------------------------------------------------------------------

fn session_thread_main(mut session: DecodeSession, cmd_rx: Receiver<SessionCommand>) {
    let video_id = session.video_id();

    // Ends on Release or when every handle is gone
    for command in cmd_rx.iter() {
        match command {
            SessionCommand::Initialize(bytes) => {
                // Failures are reported through the sink
                if let Err(e) = session.initialize(bytes) {
                    debug!("{}: initialize failed: {}", video_id, e);
                }
            }
            SessionCommand::DecodeChunk(max_frames) => {
                if let Err(e) = session.run_claimed_chunk(max_frames) {
                    debug!("{}: chunk failed: {}", video_id, e);
                }
            }
            SessionCommand::Release => break,
        }
    }

    session.release();
    info!("{}: decode thread stopped", video_id);
}
