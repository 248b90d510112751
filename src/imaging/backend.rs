//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait is the seam between the render worker and the
//! pixel work: probe a source cheaply, decode it once, save a resized copy.
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend). Tests use the
//! [`MockBackend`](tests::MockBackend), which records every call and can be
//! told to fail specific saves.
//!
//! Saves return a typed [`SaveError`] so the caller can tell a failure that
//! is worth one retry with adjusted parameters from one that is not.

use super::params::SaveParams;
use image::{DynamicImage, ImageFormat};
use image::metadata::Orientation;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot decode {path}: {message}")]
    Decode { path: String, message: String },
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Failure of a single save attempt.
#[derive(Error, Debug)]
pub enum SaveError {
    /// The encoded image did not fit in the bounded encode buffer.
    #[error("encode buffer of {limit} bytes exhausted")]
    BufferExhausted { limit: usize },
    /// The metadata block could not be written alongside the pixels.
    #[error("metadata could not be written: {0}")]
    Metadata(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// How a failed save may be attempted once more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAdjustment {
    EnlargeBuffer,
    StripMetadata,
}

impl SaveError {
    /// The adjustment that makes a retry worthwhile, if any.
    pub fn retry_adjustment(&self) -> Option<RetryAdjustment> {
        match self {
            Self::BufferExhausted { .. } => Some(RetryAdjustment::EnlargeBuffer),
            Self::Metadata(_) => Some(RetryAdjustment::StripMetadata),
            Self::Backend(_) => None,
        }
    }
}

/// Cheap facts about a source, read without decoding pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageProbe {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub exif: Option<Vec<u8>>,
}

/// A fully decoded source.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: DynamicImage,
    pub format: ImageFormat,
    pub orientation: Orientation,
    pub exif: Option<Vec<u8>>,
    /// Length of the embedded ICC profile, counted when enlarging buffers.
    pub icc_len: usize,
}

/// Trait for image processing backends.
///
/// Implementations must be `Sync`: one backend is shared by every worker.
pub trait ImageBackend: Sync {
    /// Read format, dimensions and metadata without decoding pixels.
    fn probe(&self, path: &Path) -> Result<ImageProbe, BackendError>;

    /// Decode the full image.
    fn decode(&self, path: &Path) -> Result<DecodedImage, BackendError>;

    /// Encode `image` and write it to `params.output`.
    fn save(&self, image: &DynamicImage, params: &SaveParams) -> Result<(), SaveError>;
}
