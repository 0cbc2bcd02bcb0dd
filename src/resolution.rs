//! Aspect-preserving target dimension policy shared by every backend

use serde::{Deserialize, Serialize};

/// Bounding box a converted frame must fit into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bound {
    pub width: u32,
    pub height: u32,
}

impl Bound {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Largest size fitting in `bound` with the original aspect ratio.
///
/// `None` means the `original` option: dimensions pass through unchanged. Degenerate
/// inputs (a zero side) also pass through since no ratio can be derived from them.
pub fn target_dimensions(width: u32, height: u32, bound: Option<Bound>) -> (u32, u32) {
    let Some(bound) = bound else {
        return (width, height);
    };
    if width == 0 || height == 0 || bound.width == 0 || bound.height == 0 {
        return (width, height);
    }

    let scale = f64::min(
        bound.width as f64 / width as f64,
        bound.height as f64 / height as f64,
    );
    let w = (width as f64 * scale).round().max(1.0) as u32;
    let h = (height as f64 * scale).round().max(1.0) as u32;
    (w.min(bound.width), h.min(bound.height))
}

/// Same as [`target_dimensions`] but rounded down to even sides, as required by
/// 4:2:0 video encoders.
pub fn even_target_dimensions(width: u32, height: u32, bound: Option<Bound>) -> (u32, u32) {
    let (w, h) = target_dimensions(width, height, bound);
    ((w & !1).max(2), (h & !1).max(2))
}
