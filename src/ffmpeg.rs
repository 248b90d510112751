//! External encoder commands.
//!
//! Video and audio variants are produced by an external transcoder
//! (`ffmpeg`, or `avconv` where that is what is installed). This module
//! builds the command lines from an asset's options and runs them.
//!
//! Option values are used as template substitutions:
//!
//! ```text
//! video reencode:  {binary} -loglevel {loglevel} -y -i SRC -stats
//!                  -c:v {video} -b:v {vbitrate} {other...}
//!                  -c:a {audio} -b:a {abitrate} -f {format}
//!                  -vf scale=W:H DEST
//! video thumbnails: {binary} -loglevel {loglevel} -y -i SRC
//!                  (-frames:v 1 -vf scale=W:H DEST)...
//! audio reencode:  {binary} -loglevel {loglevel} -stats -i SRC
//!                  -c:a {audio} -y DEST
//! ```
//!
//! An unset width or height becomes `-1`, which keeps the aspect ratio.
//! All stale thumbnails of a video are extracted by a single invocation.
//!
//! Commands go through the [`CommandRunner`] trait so the encoder step can be
//! tested without spawning processes.

use crate::config::SiteConfig;
use crate::options::Options;
use crate::registry::{BaseAsset, TargetSize, Variant};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

/// Binary tried when `ffmpeg` is configured but not installed.
const FALLBACK_BINARY: &str = "avconv";

/// Lines of encoder stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 5;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("missing encoder option {0:?}")]
    MissingOption(&'static str),
    #[error("invalid resolution {0:?}")]
    InvalidResolution(String),
    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// A fully built external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    program: String,
    args: Vec<OsString>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Add one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a path argument without lossy conversion.
    pub fn path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Arguments as strings, for logging and tests.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for EncoderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.args_lossy() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Executes encoder commands.
pub trait CommandRunner: Sync {
    /// Run to completion. A non-zero exit status is an error.
    fn run(&self, command: &EncoderCommand) -> Result<(), EncodeError>;
}

/// Runs commands as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &EncoderCommand) -> Result<(), EncodeError> {
        debug!(command = %command, "running encoder");
        let output = Command::new(command.program())
            .args(command.get_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| EncodeError::Spawn {
                program: command.program().to_string(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }
        Err(EncodeError::Failed {
            program: command.program().to_string(),
            status: output.status.to_string(),
            stderr: stderr_tail(&output.stderr),
        })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

// =============================================================================
// Binary detection
// =============================================================================

/// Outcome of looking up an encoder binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryResolution {
    Found(PathBuf),
    /// The configured binary is missing but the fallback exists.
    Fallback { binary: String, path: PathBuf },
    Missing,
}

/// Look up `configured` with `lookup`, falling back from `ffmpeg` to `avconv`.
pub fn resolve_binary_with(
    configured: &str,
    lookup: impl Fn(&str) -> Option<PathBuf>,
) -> BinaryResolution {
    if let Some(path) = lookup(configured) {
        return BinaryResolution::Found(path);
    }
    if configured == "ffmpeg"
        && let Some(path) = lookup(FALLBACK_BINARY)
    {
        return BinaryResolution::Fallback {
            binary: FALLBACK_BINARY.to_string(),
            path,
        };
    }
    BinaryResolution::Missing
}

/// Find `name` on `PATH`, or check it directly when it is a path.
pub fn lookup_on_path(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Which external media kinds can be encoded in this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderAvailability {
    pub video: bool,
    pub audio: bool,
}

impl EncoderAvailability {
    pub fn all() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }

    pub fn none() -> Self {
        Self {
            video: false,
            audio: false,
        }
    }
}

/// Check the configured encoder binaries before the pipeline starts.
///
/// Switches a missing `ffmpeg` to `avconv` in `config` when possible, so the
/// registries built afterwards carry the binary that will actually run.
pub fn detect_encoders(
    config: &mut SiteConfig,
    lookup: impl Fn(&str) -> Option<PathBuf>,
) -> EncoderAvailability {
    let check = |kind: &str, binary: &mut String| -> bool {
        match resolve_binary_with(binary, &lookup) {
            BinaryResolution::Found(path) => {
                debug!(kind, binary = %path.display(), "encoder found");
                true
            }
            BinaryResolution::Fallback { binary: fallback, path } => {
                warn!(kind, configured = %binary, fallback = %path.display(), "encoder not found, falling back");
                *binary = fallback;
                true
            }
            BinaryResolution::Missing => {
                warn!(kind, binary = %binary, "encoder not found, skipping all {kind} files");
                false
            }
        }
    };
    EncoderAvailability {
        video: check("video", &mut config.video.binary),
        audio: check("audio", &mut config.audio.binary),
    }
}

// =============================================================================
// Command templates
// =============================================================================

fn required(options: &Options, key: &'static str) -> Result<String, EncodeError> {
    options
        .template_value(key)
        .ok_or(EncodeError::MissingOption(key))
}

fn dimension(value: Option<u32>) -> String {
    value.map_or_else(|| "-1".to_string(), |v| v.to_string())
}

/// `scale=W:H` filter, `-1` for unset sides.
pub fn scale_filter(size: TargetSize) -> String {
    format!("scale={}:{}", dimension(size.width), dimension(size.height))
}

/// Base command: binary, log level, overwrite flag and input.
fn base_command(asset: &BaseAsset) -> Result<EncoderCommand, EncodeError> {
    let options = asset.options();
    Ok(EncoderCommand::new(required(options, "binary")?)
        .arg("-loglevel")
        .arg(required(options, "loglevel")?))
}

/// Transcode `asset` into one re-encode `variant`.
///
/// A variant without a size uses the `resolution` option.
pub fn video_reencode_command(
    asset: &BaseAsset,
    variant: &Variant,
) -> Result<EncoderCommand, EncodeError> {
    let options = asset.options();
    let size = if variant.size().is_unconstrained() {
        let resolution = required(options, "resolution")?;
        resolution
            .parse::<TargetSize>()
            .map_err(|_| EncodeError::InvalidResolution(resolution))?
    } else {
        variant.size()
    };
    let other = options.template_value("other").unwrap_or_default();

    Ok(base_command(asset)?
        .arg("-y")
        .arg("-i")
        .path(asset.source())
        .arg("-stats")
        .args(["-c:v".to_string(), required(options, "video")?])
        .args(["-b:v".to_string(), required(options, "vbitrate")?])
        .args(other.split_whitespace())
        .args(["-c:a".to_string(), required(options, "audio")?])
        .args(["-b:a".to_string(), required(options, "abitrate")?])
        .args(["-f".to_string(), required(options, "format")?])
        .args(["-vf".to_string(), scale_filter(size)])
        .path(variant.dest()))
}

/// Extract one frame per thumbnail variant in a single invocation.
pub fn video_thumbnail_command(
    asset: &BaseAsset,
    variants: &[&Variant],
) -> Result<EncoderCommand, EncodeError> {
    let mut command = base_command(asset)?.arg("-y").arg("-i").path(asset.source());
    for variant in variants {
        command = command
            .args(["-frames:v", "1", "-vf"])
            .arg(scale_filter(variant.size()))
            .path(variant.dest());
    }
    Ok(command)
}

/// Transcode an audio asset.
pub fn audio_reencode_command(
    asset: &BaseAsset,
    variant: &Variant,
) -> Result<EncoderCommand, EncodeError> {
    let options = asset.options();
    Ok(base_command(asset)?
        .arg("-stats")
        .arg("-i")
        .path(asset.source())
        .args(["-c:a".to_string(), required(options, "audio")?])
        .arg("-y")
        .path(variant.dest()))
}
