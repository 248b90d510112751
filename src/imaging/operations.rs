//! High-level pixel operations used by the render worker.
//!
//! These combine the pure [`calculations`](super::calculations) with the
//! `image` crate's resampling. They never touch the filesystem.

use super::calculations::{bounds_for, fit_within};
use crate::registry::TargetSize;
use image::DynamicImage;
use image::imageops::FilterType;
use image::metadata::Orientation;

/// Output dimensions of `image` for a variant of `size`.
pub fn target_dimensions(image: &DynamicImage, size: TargetSize) -> (u32, u32) {
    fit_within((image.width(), image.height()), bounds_for(size))
}

/// Resize `image` to fit within `size` with a Lanczos3 filter.
///
/// Unset sides are unconstrained. Images already inside the box are
/// returned unchanged (cloned).
pub fn resize_to(image: &DynamicImage, size: TargetSize) -> DynamicImage {
    let (w, h) = target_dimensions(image, size);
    if (w, h) == (image.width(), image.height()) {
        return image.clone();
    }
    image.resize_exact(w, h, FilterType::Lanczos3)
}

/// Rotate/flip `image` so it displays upright.
///
/// Returns whether any transform was applied.
pub fn orient(image: &mut DynamicImage, orientation: Orientation) -> bool {
    if orientation == Orientation::NoTransforms {
        return false;
    }
    image.apply_orientation(orientation);
    true
}
