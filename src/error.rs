//! Error types for the decode pipeline (thiserror-based).

use thiserror::Error;

use crate::session::SessionState;

/// Everything that can go wrong between `initialize` and `release`.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The container holds no track whose mime type starts with `video/`.
    #[error("No video track found")]
    NoVideoTrack,

    /// The engine rejected the track format or decoder parameters.
    #[error("Decoder configuration failed: {0}")]
    Configuration(String),

    /// Runtime failure reported by the decode engine.
    #[error("Decode engine error: {0}")]
    Engine(String),

    /// A chunk is already in flight. Absorbed by the session, never signalled.
    #[error("A decode chunk is already in flight")]
    AlreadyBusy,

    /// A command arrived while the session could not serve it.
    #[error("Session not initialized (state: {0:?})")]
    NotInitialized(SessionState),

    /// The engine could not open the supplied bytes as a container.
    #[error("Invalid container: {0}")]
    InvalidContainer(String),

    /// A wire frame failed to parse.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The session worker has already shut down.
    #[error("Session worker is no longer running")]
    WorkerGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Short machine-readable code, mirroring the helper protocol's error codes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoVideoTrack => error_codes::NO_VIDEO_TRACK,
            Self::Configuration(_) => error_codes::CONFIGURATION_ERROR,
            Self::Engine(_) => error_codes::DECODE_ENGINE_ERROR,
            Self::AlreadyBusy => error_codes::ALREADY_BUSY,
            Self::NotInitialized(_) => error_codes::NOT_INITIALIZED,
            Self::InvalidContainer(_) => error_codes::INVALID_CONTAINER,
            Self::InvalidFrame(_) => error_codes::INVALID_FRAME,
            Self::WorkerGone => error_codes::WORKER_GONE,
            Self::Io(_) => error_codes::INTERNAL_ERROR,
        }
    }
}

/// Error codes
pub mod error_codes {
    pub const NO_VIDEO_TRACK: &str = "NO_VIDEO_TRACK";
    pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
    pub const DECODE_ENGINE_ERROR: &str = "DECODE_ENGINE_ERROR";
    pub const ALREADY_BUSY: &str = "ALREADY_BUSY";
    pub const NOT_INITIALIZED: &str = "NOT_INITIALIZED";
    pub const INVALID_CONTAINER: &str = "INVALID_CONTAINER";
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    pub const WORKER_GONE: &str = "WORKER_GONE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Convenience Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, DecodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(DecodeError::NoVideoTrack.code(), "NO_VIDEO_TRACK");
        assert_eq!(DecodeError::Engine("boom".into()).code(), "DECODE_ENGINE_ERROR");
        assert_eq!(
            DecodeError::NotInitialized(SessionState::Uninitialized).code(),
            "NOT_INITIALIZED"
        );
    }

    #[test]
    fn display_carries_engine_message() {
        let err = DecodeError::Engine("codec exploded".into());
        assert_eq!(err.to_string(), "Decode engine error: codec exploded");
    }
}
