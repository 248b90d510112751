//! Shared test utilities.
//!
//! Synthetic media files and registry fixtures for unit tests.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let site = TestSite::new();
//! site.write_jpeg("landscapes/dawn.jpg", 200, 150);
//! let mut registries = site.registries();
//! registries.images.get("landscapes", "dawn.jpg");
//! ```

use crate::cache::cache_path;
use crate::config::SiteConfig;
use crate::registry::Registries;
use image::{ImageEncoder, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// =========================================================================
// Synthetic files
// =========================================================================

/// Write a small valid JPEG with the given dimensions.
pub fn create_test_jpeg(path: &Path, width: u32, height: u32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let file = fs::File::create(path).unwrap();
    let writer = std::io::BufWriter::new(file);
    image::codecs::jpeg::JpegEncoder::new(writer)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
}

/// Write arbitrary bytes, creating parent directories.
pub fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

// =========================================================================
// Site fixture
// =========================================================================

/// A temporary content root with an `out/` output directory inside it.
pub struct TestSite {
    pub tmp: TempDir,
}

impl TestSite {
    pub fn new() -> Self {
        Self {
            tmp: TempDir::new().unwrap(),
        }
    }

    pub fn content(&self) -> &Path {
        self.tmp.path()
    }

    pub fn output(&self) -> PathBuf {
        self.tmp.path().join("out")
    }

    pub fn cache_file(&self) -> PathBuf {
        cache_path(&self.output())
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.tmp.path().join(relative)
    }

    pub fn write_jpeg(&self, relative: &str, width: u32, height: u32) -> PathBuf {
        let path = self.path(relative);
        create_test_jpeg(&path, width, height);
        path
    }

    pub fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.path(relative);
        write_file(&path, contents);
        path
    }

    /// Empty registries with stock default options.
    pub fn registries(&self) -> Registries {
        Registries::new(self.content(), &self.output(), &SiteConfig::default())
    }
}
