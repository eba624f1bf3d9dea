//! Hardware decoder selection
//!
//! Engines advertise decoder implementations as [`DecoderInfo`] entries. A
//! hardware entry is only worth trying when it supports the track's mime type
//! and can output one of the layouts consumers understand; otherwise the
//! session falls back to the engine's default decoder for the mime type.

use super::DecoderInfo;
use crate::protocol::PixelLayout;

/// Output layouts in order of preference.
pub const LAYOUT_PREFERENCE: [PixelLayout; 3] = [
    PixelLayout::Yuv420Planar,
    PixelLayout::Yuv420SemiPlanar,
    PixelLayout::Yuv420Flexible,
];

/// A hardware decoder worth trying, with the layout to request from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderCandidate {
    pub name: String,
    pub layout: PixelLayout,
}

fn layout_rank(layout: PixelLayout) -> Option<usize> {
    LAYOUT_PREFERENCE.iter().position(|&l| l == layout)
}

/// Hardware decoders for `mime`, best first.
///
/// Entries are ordered by their best advertised layout, ties keep the
/// engine's own ordering. An empty result means "use the by-type lookup".
pub fn rank_decoders(capabilities: &[DecoderInfo], mime: &str) -> Vec<DecoderCandidate> {
    let mut ranked: Vec<(usize, usize, DecoderCandidate)> = capabilities
        .iter()
        .enumerate()
        .filter(|(_, info)| info.hardware && info.supports(mime))
        .filter_map(|(order, info)| {
            info.layouts
                .iter()
                .filter_map(|&l| layout_rank(l).map(|rank| (rank, l)))
                .min_by_key(|(rank, _)| *rank)
                .map(|(rank, layout)| {
                    (
                        rank,
                        order,
                        DecoderCandidate {
                            name: info.name.clone(),
                            layout,
                        },
                    )
                })
        })
        .collect();

    ranked.sort_by_key(|(rank, order, _)| (*rank, *order));
    ranked.into_iter().map(|(_, _, c)| c).collect()
}
