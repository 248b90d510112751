//! Image processing, pure Rust.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Probe** | `ImageReader::into_decoder` (dimensions, EXIF, no pixels) |
//! | **Decode** | `DynamicImage::from_decoder` |
//! | **Orient** | EXIF orientation tag + `DynamicImage::apply_orientation` |
//! | **Resize** | Lanczos3 `resize_exact` within the target box |
//! | **Encode** | JPEG / PNG / WebP encoders behind a bounded buffer |
//!
//! The module is split into:
//! - **Calculations**: pure dimension and buffer-size math (unit testable)
//! - **Parameters**: what one save needs ([`SaveParams`], [`Quality`])
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Operations**: pixel transforms used by the render worker
//! - **EXIF**: orientation tag access and JPEG APP1 embedding

pub mod backend;
mod calculations;
pub mod exif;
pub mod operations;
mod params;
pub mod rust_backend;

pub use backend::{
    BackendError, DecodedImage, ImageBackend, ImageProbe, RetryAdjustment, SaveError,
};
pub use calculations::{UNBOUNDED_DIMENSION, bounds_for, enlarged_buffer, fit_within};
pub use operations::{orient, resize_to, target_dimensions};
pub use params::{Quality, SaveParams};
pub use rust_backend::RustBackend;
