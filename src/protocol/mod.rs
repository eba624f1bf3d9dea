//! Protocol module - frame wire format and stream metadata

pub mod frame;
mod metadata;

pub use frame::{encode_frame, mark_end_of_stream, parse_frame, FrameHeader, FrameIter};
pub use metadata::{StreamInfo, VideoId};

use serde::{Deserialize, Serialize};

/// Which frame header layout a deployment speaks. Never mix both.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// 25-byte header: timestamp, Y/U/V strides, EOS flag, payload length.
    #[default]
    Standard,
    /// 20-byte header: timestamp, Y stride, combined UV stride, payload length.
    Legacy,
}

impl WireFormat {
    pub const fn header_size(self) -> usize {
        match self {
            Self::Standard => frame::STANDARD_HEADER_SIZE,
            Self::Legacy => frame::LEGACY_HEADER_SIZE,
        }
    }
}

/// Plane arrangement of decoded YUV 4:2:0 data.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelLayout {
    /// Y, then U, then V (I420).
    Yuv420Planar,
    /// Y, then interleaved UV (NV12).
    Yuv420SemiPlanar,
    /// Engine-defined plane layout described by per-plane strides.
    Yuv420Flexible,
    #[default]
    Unknown,
}

impl PixelLayout {
    pub fn is_semi_planar(self) -> bool {
        matches!(self, Self::Yuv420SemiPlanar)
    }

    /// Whether frames in this layout can be handed to consumers.
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Yuv420Planar => "YUV420Planar",
            Self::Yuv420SemiPlanar => "YUV420SemiPlanar",
            Self::Yuv420Flexible => "YUV420PlanarFlexible",
            Self::Unknown => "Unknown",
        }
    }
}

/// Row strides of the decoded planes, in bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneStrides {
    pub y: u32,
    pub u: u32,
    pub v: u32,
}

impl PlaneStrides {
    pub const fn planar(y: u32, u: u32, v: u32) -> Self {
        Self { y, u, v }
    }

    /// For NV12-style layouts both chroma strides are the UV plane stride.
    pub const fn semi_planar(y: u32, uv: u32) -> Self {
        Self { y, u: uv, v: uv }
    }
}
