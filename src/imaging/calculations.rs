//! Pure calculation functions for image dimensions and buffer sizing.
//!
//! All functions here are pure and testable without any I/O or images.

use crate::registry::TargetSize;

/// Bound substituted for an unset target dimension.
///
/// Large enough that no real photo is constrained by it, small enough that
/// the aspect-ratio arithmetic stays well inside `u32`.
pub const UNBOUNDED_DIMENSION: u32 = 65_596;

/// Fixed slack added when enlarging the encode buffer.
const BUFFER_SLACK: usize = 10;

/// Bounding box for a target size, with unset sides unbounded.
pub fn bounds_for(size: TargetSize) -> (u32, u32) {
    (
        size.width.unwrap_or(UNBOUNDED_DIMENSION),
        size.height.unwrap_or(UNBOUNDED_DIMENSION),
    )
}

/// Fit `source` inside `bounds`, preserving aspect ratio.
///
/// Never upscales: a source already inside the box keeps its size. Each
/// side is at least one pixel.
///
/// # Examples
/// ```
/// # use recitale::imaging::fit_within;
/// assert_eq!(fit_within((4000, 3000), (65_596, 900)), (1200, 900));
/// assert_eq!(fit_within((800, 600), (1200, 65_596)), (800, 600));
/// ```
pub fn fit_within(source: (u32, u32), bounds: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let (max_w, max_h) = bounds;
    if src_w == 0 || src_h == 0 {
        return (src_w.max(1), src_h.max(1));
    }
    if src_w <= max_w && src_h <= max_h {
        return source;
    }

    let scale = f64::min(max_w as f64 / src_w as f64, max_h as f64 / src_h as f64);
    let w = ((src_w as f64 * scale).round() as u32).clamp(1, max_w);
    let h = ((src_h as f64 * scale).round() as u32).clamp(1, max_h);
    (w, h)
}

/// Buffer size for the single retry after the encoder ran out of room.
///
/// Four bytes per output pixel plus the ICC profile and a little slack,
/// never smaller than what was already tried.
pub fn enlarged_buffer(current: usize, output: (u32, u32), icc_len: usize) -> usize {
    let pixels = output.0 as usize * output.1 as usize;
    current.max(4 * pixels + icc_len + BUFFER_SLACK)
}
