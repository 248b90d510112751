//! Build configuration.
//!
//! Handles loading, validating, and merging `recitale.toml`. Stock defaults
//! are serialized to a TOML table, the user file (if any) is merged on top
//! key by key, and the result is deserialized with unknown keys rejected.
//!
//! ## Config File Location
//!
//! Place `recitale.toml` in the content root:
//!
//! ```text
//! content/
//! ├── recitale.toml
//! ├── landscapes/
//! │   ├── 001.jpg
//! │   └── ...
//! └── travel/
//!     └── ...
//! ```
//!
//! ## Configuration Options
//!
//! ```toml
//! [image]
//! quality = 75              # JPEG quality (1-100)
//! auto-orient = true        # Rotate according to EXIF orientation
//! strip = true              # Drop EXIF metadata from thumbnails
//! progressive = true        # Write progressive JPEGs
//! encode_buffer = 4194304   # Initial encode buffer in bytes, enlarged once
//!
//! [video]
//! binary = "ffmpeg"
//! loglevel = "error"
//! format = "webm"
//! resolution = "1280x720"
//! vbitrate = "3900k"
//! abitrate = "100k"
//! audio = "libvorbis"
//! video = "libvpx"
//! other = "-qmin 10 -qmax 42 -maxrate 500k -bufsize 1500k"
//! extension = "webm"
//!
//! [audio]
//! binary = "ffmpeg"
//! loglevel = "error"
//! audio = "libmp3lame"
//! extension = "mp3"
//!
//! [variants]
//! image = ["x900", "1200x"]
//! video_thumbnail = ["x900"]
//! video_reencode = ["1280x720"]
//! audio_reencode = true
//!
//! [processing]
//! max_processes = 4         # Omit for auto-detection (= CPU cores)
//! ```
//!
//! The `[image]`, `[video]` and `[audio]` sections become the default
//! [`Options`] of the matching registry. Every key in them except
//! `encode_buffer` takes part in the fingerprint, so changing one re-renders
//! the affected files on the next build.

use crate::options::Options;
use crate::registry::TargetSize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Name of the config file in the content root.
pub const CONFIG_FILENAME: &str = "recitale.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Build configuration loaded from `recitale.toml`.
///
/// All fields have defaults. User files only list what they override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    pub image: ImageConfig,
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub variants: VariantsConfig,
    pub processing: ProcessingConfig,
}

impl SiteConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.image.quality) {
            return Err(ConfigError::Validation(
                "image.quality must be 1-100".into(),
            ));
        }
        if self.image.encode_buffer == 0 {
            return Err(ConfigError::Validation(
                "image.encode_buffer must be positive".into(),
            ));
        }
        if self.video.binary.trim().is_empty() {
            return Err(ConfigError::Validation("video.binary must not be empty".into()));
        }
        if self.audio.binary.trim().is_empty() {
            return Err(ConfigError::Validation("audio.binary must not be empty".into()));
        }
        if self.video.extension.is_empty() || self.audio.extension.is_empty() {
            return Err(ConfigError::Validation(
                "video.extension and audio.extension must not be empty".into(),
            ));
        }
        if self.processing.max_processes == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_processes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Default options for image thumbnails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    /// JPEG encoding quality (1 = worst, 100 = best).
    pub quality: u32,
    /// Apply the EXIF orientation to the pixels.
    #[serde(rename = "auto-orient")]
    pub auto_orient: bool,
    /// Drop EXIF metadata from derived files.
    pub strip: bool,
    /// Write JPEG thumbnails as progressive scans.
    pub progressive: bool,
    /// Initial size of the bounded encode buffer, in bytes.
    pub encode_buffer: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            quality: 75,
            auto_orient: true,
            strip: true,
            progressive: true,
            encode_buffer: 4 * 1024 * 1024,
        }
    }
}

impl ImageConfig {
    pub fn to_options(&self) -> Options {
        Options::new()
            .with("quality", self.quality)
            .with("auto-orient", self.auto_orient)
            .with("strip", self.strip)
            .with("progressive", self.progressive)
    }
}

/// External video encoder settings, used as command template values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoConfig {
    pub binary: String,
    pub loglevel: String,
    pub format: String,
    /// Size used for re-encodes that do not specify one.
    pub resolution: String,
    pub vbitrate: String,
    pub abitrate: String,
    pub audio: String,
    pub video: String,
    /// Extra encoder arguments, split on whitespace.
    pub other: String,
    pub extension: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".into(),
            loglevel: "error".into(),
            format: "webm".into(),
            resolution: "1280x720".into(),
            vbitrate: "3900k".into(),
            abitrate: "100k".into(),
            audio: "libvorbis".into(),
            video: "libvpx".into(),
            other: "-qmin 10 -qmax 42 -maxrate 500k -bufsize 1500k".into(),
            extension: "webm".into(),
        }
    }
}

impl VideoConfig {
    pub fn to_options(&self) -> Options {
        Options::new()
            .with("binary", self.binary.as_str())
            .with("loglevel", self.loglevel.as_str())
            .with("format", self.format.as_str())
            .with("resolution", self.resolution.as_str())
            .with("vbitrate", self.vbitrate.as_str())
            .with("abitrate", self.abitrate.as_str())
            .with("audio", self.audio.as_str())
            .with("video", self.video.as_str())
            .with("other", self.other.as_str())
            .with("extension", self.extension.as_str())
    }
}

/// External audio encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    pub binary: String,
    pub loglevel: String,
    pub audio: String,
    pub extension: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".into(),
            loglevel: "error".into(),
            audio: "libmp3lame".into(),
            extension: "mp3".into(),
        }
    }
}

impl AudioConfig {
    pub fn to_options(&self) -> Options {
        Options::new()
            .with("binary", self.binary.as_str())
            .with("loglevel", self.loglevel.as_str())
            .with("audio", self.audio.as_str())
            .with("extension", self.extension.as_str())
    }
}

/// Derived variants requested for every discovered file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VariantsConfig {
    pub image: Vec<TargetSize>,
    pub video_thumbnail: Vec<TargetSize>,
    pub video_reencode: Vec<TargetSize>,
    pub audio_reencode: bool,
}

impl Default for VariantsConfig {
    fn default() -> Self {
        Self {
            image: vec![TargetSize::height(900), TargetSize::width(1200)],
            video_thumbnail: vec![TargetSize::height(900)],
            video_reencode: vec![TargetSize::new(Some(1280), Some(720))],
            audio_reencode: true,
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel image workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

/// Resolve the worker count.
///
/// - `jobs` (the `-j` flag) wins when given, at least 1
/// - otherwise `max_processes` is clamped to the core count
/// - otherwise all available cores
pub fn effective_threads(config: &ProcessingConfig, jobs: Option<usize>) -> usize {
    if let Some(jobs) = jobs {
        return jobs.max(1);
    }
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_processes.map(|n| n.min(cores)).unwrap_or(cores)
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the base layer user overrides are merged onto.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(SiteConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load `recitale.toml` from a directory as a raw TOML value.
///
/// Returns `Ok(None)` if the directory has no config file.
pub fn load_raw_config(dir: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let config_path = dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&config_path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<SiteConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: SiteConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `recitale.toml` in the given directory.
pub fn load_config(root: &Path) -> Result<SiteConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let overlay = load_raw_config(root)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `recitale.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# recitale configuration
# ======================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys cause an error.
#
# Changing any value in [image], [video] or [audio] (except encode_buffer)
# re-renders the affected files on the next build.

# ---------------------------------------------------------------------------
# Image thumbnails
# ---------------------------------------------------------------------------
[image]
# JPEG quality (1 = worst, 100 = best).
quality = 75

# Rotate pixels according to the EXIF orientation tag.
auto-orient = true

# Drop EXIF metadata from thumbnails.
strip = true

# Write progressive JPEGs instead of baseline ones.
progressive = true

# Initial encode buffer size in bytes. A save that outgrows it is retried
# once with a larger buffer.
encode_buffer = 4194304

# ---------------------------------------------------------------------------
# Video encoder (values are substituted into the encoder command)
# ---------------------------------------------------------------------------
[video]
# Falls back to avconv when ffmpeg is not installed.
binary = "ffmpeg"
loglevel = "error"
format = "webm"
# Size used by re-encodes that do not request one.
resolution = "1280x720"
vbitrate = "3900k"
abitrate = "100k"
audio = "libvorbis"
video = "libvpx"
other = "-qmin 10 -qmax 42 -maxrate 500k -bufsize 1500k"
extension = "webm"

# ---------------------------------------------------------------------------
# Audio encoder
# ---------------------------------------------------------------------------
[audio]
binary = "ffmpeg"
loglevel = "error"
audio = "libmp3lame"
extension = "mp3"

# ---------------------------------------------------------------------------
# Derived variants requested for every file found in the content tree.
# Sizes are "WxH"; leave a side empty to keep it unconstrained.
# ---------------------------------------------------------------------------
[variants]
image = ["x900", "1200x"]
video_thumbnail = ["x900"]
video_reencode = ["1280x720"]
audio_reencode = true

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel image workers.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_processes = 4
"##
}
