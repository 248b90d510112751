//! Regeneration fingerprints.
//!
//! A [`Fingerprint`] captures everything that decides whether a derived file
//! is still current: the source file's modification stamp, the digest of the
//! effective options, and the observable state of the derived file itself.
//! Computing one costs a `stat` of each path and nothing else.
//!
//! Including the derived state means an output that was deleted, truncated
//! or replaced since the last build no longer matches its stored fingerprint.

use crate::options::Options;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Modification time and length of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub modified_secs: u64,
    pub modified_nanos: u32,
    pub len: u64,
}

impl FileStamp {
    /// Stat `path`. A missing file is `Ok(None)`; other errors propagate.
    pub fn of(path: &Path) -> io::Result<Option<Self>> {
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        // Timestamps before the epoch collapse to zero
        let since_epoch = meta.modified()?.duration_since(UNIX_EPOCH).unwrap_or_default();
        Ok(Some(Self {
            modified_secs: since_epoch.as_secs(),
            modified_nanos: since_epoch.subsec_nanos(),
            len: meta.len(),
        }))
    }
}

/// Stored value of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub source: FileStamp,
    pub options: String,
    /// `None` when the derived file does not exist.
    pub derived: Option<FileStamp>,
}

impl Fingerprint {
    pub fn derived_exists(&self) -> bool {
        self.derived.is_some()
    }
}

/// Compute the fingerprint of a (source, derived) pair under `options`.
///
/// Superficial option keys are ignored. Fails when the source cannot be
/// stat'ed: there is nothing meaningful to fingerprint without it.
pub fn fingerprint(source: &Path, options: &Options, derived: &Path) -> io::Result<Fingerprint> {
    let source_stamp = FileStamp::of(source)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("source {} does not exist", source.display()),
        )
    })?;
    Ok(Fingerprint {
        source: source_stamp,
        options: options.digest(),
        derived: FileStamp::of(derived)?,
    })
}
