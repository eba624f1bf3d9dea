//! Video track selection

use tracing::debug;

use super::{Container, TrackFormat};
use crate::error::{DecodeError, Result};

/// Frame rate assumed when the container carries none.
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Index of the first track whose mime type starts with `video/`.
///
/// First match wins; several video tracks are not ranked against each other.
pub fn select_video_track(container: &dyn Container) -> Result<usize> {
    (0..container.track_count())
        .find(|&i| {
            container
                .track_format(i)
                .map(|f| f.is_video())
                .unwrap_or(false)
        })
        .ok_or(DecodeError::NoVideoTrack)
}

/// Codec parameters of `index`, with container gaps filled in.
pub fn extract_format(container: &dyn Container, index: usize) -> Result<TrackFormat> {
    let mut format = container
        .track_format(index)
        .ok_or_else(|| DecodeError::InvalidContainer(format!("track {} does not exist", index)))?;

    if format.frame_rate == 0 {
        debug!(
            "Track {} has no frame rate, assuming {} fps",
            index, DEFAULT_FRAME_RATE
        );
        format.frame_rate = DEFAULT_FRAME_RATE;
    }
    if format.duration_us < 0 {
        format.duration_us = 0;
    }

    Ok(format)
}
