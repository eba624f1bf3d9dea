//! Session configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::StalePolicy;
use crate::error::{DecodeError, Result};
use crate::protocol::WireFormat;

/// Maximum number of free buffers kept by the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 20;

/// What happens when the bitstream runs out of samples.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Seek back to the first sync sample and keep decoding.
    #[default]
    Loop,
    /// Stop at end of stream; the chunk in flight completes early.
    SingleShot,
}

/// Per-session tuning knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cap on pooled free buffers.
    pub pool_capacity: usize,
    /// How long one input/output poll against the engine may wait.
    pub poll_timeout_us: u64,
    /// A chunk with no engine progress for this long fails.
    pub stall_timeout_ms: u64,
    pub playback_mode: PlaybackMode,
    pub wire_format: WireFormat,
    pub stale_policy: StalePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            poll_timeout_us: 2_000,
            stall_timeout_ms: 5_000,
            playback_mode: PlaybackMode::Loop,
            wire_format: WireFormat::Standard,
            stale_policy: StalePolicy::EvictOldestOnMismatch,
        }
    }
}

impl SessionConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| DecodeError::Configuration(format!("invalid session config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout_us == 0 {
            return Err(DecodeError::Configuration(
                "poll_timeout_us must be > 0".to_string(),
            ));
        }
        if self.stall_timeout_ms == 0 {
            return Err(DecodeError::Configuration(
                "stall_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_micros(self.poll_timeout_us)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn with_playback_mode(mut self, mode: PlaybackMode) -> Self {
        self.playback_mode = mode;
        self
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.pool_capacity, 20);
        assert_eq!(config.poll_timeout(), Duration::from_millis(2));
        assert_eq!(config.playback_mode, PlaybackMode::Loop);
        assert_eq!(config.wire_format, WireFormat::Standard);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            SessionConfig::from_json(r#"{"playback_mode":"single_shot","pool_capacity":4}"#)
                .unwrap();
        assert_eq!(config.playback_mode, PlaybackMode::SingleShot);
        assert_eq!(config.pool_capacity, 4);
        assert_eq!(config.poll_timeout_us, 2_000);
        assert_eq!(config.stale_policy, StalePolicy::EvictOldestOnMismatch);
    }

    #[test]
    fn zero_poll_timeout_is_rejected() {
        let err = SessionConfig::from_json(r#"{"poll_timeout_us":0}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Configuration(_)));
    }

    #[test]
    fn legacy_wire_from_json() {
        let config = SessionConfig::from_json(r#"{"wire_format":"legacy"}"#).unwrap();
        assert_eq!(config.wire_format, WireFormat::Legacy);
    }
}
