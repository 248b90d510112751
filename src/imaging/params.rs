//! Parameter types for image saves.
//!
//! These structs describe *what* to write, not *how*. The render worker
//! builds a [`SaveParams`] per variant, and the retry policy adjusts it
//! (larger buffer, no metadata) before a second attempt.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100, default 75). Clamped on construction.
//! - [`SaveParams`]: Output path, quality, scan mode, buffer bound and metadata to embed.

use crate::options::Options;
use std::path::PathBuf;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Quality from an options set, falling back to the default.
    pub fn from_options(options: &Options) -> Self {
        options
            .u64("quality")
            .map(|q| Self::new(u32::try_from(q).unwrap_or(u32::MAX)))
            .unwrap_or_default()
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(75)
    }
}

/// Everything a backend needs to write one derived image.
///
/// The output format follows the extension of `output`.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveParams {
    pub output: PathBuf,
    pub quality: Quality,
    /// Write JPEG output as a progressive scan. Ignored for other formats.
    pub progressive: bool,
    /// Upper bound on the encoded size in bytes. `None` is unbounded.
    pub buffer_limit: Option<usize>,
    /// EXIF block to embed, if metadata is kept.
    pub exif: Option<Vec<u8>>,
}

impl SaveParams {
    pub fn new(output: impl Into<PathBuf>, quality: Quality) -> Self {
        Self {
            output: output.into(),
            quality,
            progressive: false,
            buffer_limit: None,
            exif: None,
        }
    }

    pub fn with_progressive(mut self, progressive: bool) -> Self {
        self.progressive = progressive;
        self
    }

    pub fn with_buffer_limit(mut self, limit: Option<usize>) -> Self {
        self.buffer_limit = limit;
        self
    }

    pub fn with_exif(mut self, exif: Option<Vec<u8>>) -> Self {
        self.exif = exif;
        self
    }
}
