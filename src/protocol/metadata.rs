//! Stream metadata reported once a session is initialized

use serde::{Deserialize, Serialize};

use super::PixelLayout;

/// Opaque caller-assigned identifier of one video.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(pub u64);

impl std::fmt::Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "video_{:08x}", self.0)
    }
}

impl From<u64> for VideoId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Payload of `on_initialized`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub video_id: VideoId,
    pub mime: String,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_layout: PixelLayout,
    pub duration_us: i64,
    pub decoder: String,
    pub hw_accel: bool,
}
