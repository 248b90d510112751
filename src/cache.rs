//! Incremental-build cache.
//!
//! Rendering a thumbnail or transcoding a video is the expensive part of a
//! build. This module remembers, for every (source, derived) pair, the
//! [`Fingerprint`] seen the last time the derived file was written, so the
//! pipeline can skip work whose inputs have not changed.
//!
//! # Design
//!
//! ## Keys and values
//!
//! Entries are keyed by the lexically normalized source path and derived
//! path (see [`crate::paths`]). The value is a fingerprint of the source's
//! modification stamp, the digest of the effective options, and the state of
//! the derived file. A lookup is a hit only when a fresh fingerprint equals
//! the stored one **and** the derived file exists, so deleting or replacing
//! an output forces it to be rebuilt.
//!
//! Entries are only created or refreshed after a successful render and are
//! never removed. Stale entries for files that no longer exist are harmless:
//! they simply never match again.
//!
//! ## Concurrency
//!
//! The store is never mutated from worker threads. Workers look up against a
//! shared `&CacheStore` and return [`WriteIntent`]s in their results; the
//! coordinator [`merge`](CacheStore::merge)s them after each phase.
//!
//! ## Storage
//!
//! One JSON file, `.recitale-cache.json`, at the root of the output tree.
//! A missing file is a cold start. A corrupt file, or one written by a
//! different format version, is a cold start with a warning. Any other read
//! failure (permission denied, path is a directory) is fatal. Flushing writes
//! a temporary sibling and renames it over the real file.
//!
//! [`CacheSession`] ties the store to its file for the lifetime of a build:
//! the flush happens in [`finish`](CacheSession::finish) on the normal path
//! and in `Drop` on every other one.

use crate::fingerprint::{Fingerprint, fingerprint};
use crate::options::Options;
use crate::paths;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Name of the cache file within the output directory.
const CACHE_FILENAME: &str = ".recitale-cache.json";

/// Version of the cache file format. Bump this to invalidate all existing
/// caches when the format or fingerprint computation changes.
const CACHE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cannot read cache file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write cache file {path}: {source}")]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot serialize cache: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identity of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub source: String,
    pub derived: String,
}

impl CacheKey {
    pub fn new(source: &Path, derived: &Path) -> Self {
        Self {
            source: paths::key_string(source),
            derived: paths::key_string(derived),
        }
    }
}

/// A fingerprint captured by a worker after a successful render, waiting to
/// be merged into the store by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteIntent {
    pub key: CacheKey,
    pub fingerprint: Fingerprint,
}

impl WriteIntent {
    /// Fingerprint a freshly written derived file.
    ///
    /// Fails if the derived file is missing: a render that reported success
    /// without producing its output is not a success.
    pub fn capture(source: &Path, derived: &Path, options: &Options) -> io::Result<Self> {
        let fingerprint = fingerprint(source, options, derived)?;
        if !fingerprint.derived_exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("derived file {} missing after render", derived.display()),
            ));
        }
        Ok(Self {
            key: CacheKey::new(source, derived),
            fingerprint,
        })
    }
}

/// On-disk form. Entries are a sorted list so the file diffs cleanly.
#[derive(serde::Serialize, serde::Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<StoredEntry>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredEntry {
    source: String,
    derived: String,
    fingerprint: Fingerprint,
}

/// In-memory mapping (source, derived) → last-seen fingerprint.
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    entries: HashMap<CacheKey, Fingerprint>,
}

impl CacheStore {
    /// An empty store (first build or `--no-cache`).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the store from `path`.
    ///
    /// Missing, corrupt and wrong-version files yield an empty store; only
    /// unrecoverable read errors are returned.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no cache file, cold start");
                return Ok(Self::empty());
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(path = %path.display(), error = %e, "cache file is not valid UTF-8, rebuilding everything");
                return Ok(Self::empty());
            }
            Err(source) => {
                return Err(CacheError::Open {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let file: CacheFile = match serde_json::from_str(&content) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache file is corrupt, rebuilding everything");
                return Ok(Self::empty());
            }
        };
        if file.version != CACHE_VERSION {
            warn!(
                path = %path.display(),
                found = file.version,
                expected = CACHE_VERSION,
                "cache file version mismatch, rebuilding everything"
            );
            return Ok(Self::empty());
        }
        let entries = file
            .entries
            .into_iter()
            .map(|e| {
                (
                    CacheKey {
                        source: e.source,
                        derived: e.derived,
                    },
                    e.fingerprint,
                )
            })
            .collect();
        Ok(Self { entries })
    }

    /// Persist the store, replacing `path` atomically.
    pub fn flush(&self, path: &Path) -> Result<(), CacheError> {
        let flush_err = |source| CacheError::Flush {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(flush_err)?;
        }

        let mut entries: Vec<StoredEntry> = self
            .entries
            .iter()
            .map(|(k, fp)| StoredEntry {
                source: k.source.clone(),
                derived: k.derived.clone(),
                fingerprint: fp.clone(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.source, &a.derived).cmp(&(&b.source, &b.derived)));
        let json = serde_json::to_string_pretty(&CacheFile {
            version: CACHE_VERSION,
            entries,
        })?;

        let tmp = temp_path(path);
        fs::write(&tmp, json).map_err(flush_err)?;
        fs::rename(&tmp, path).map_err(flush_err)?;
        debug!(path = %path.display(), entries = self.entries.len(), "cache flushed");
        Ok(())
    }

    /// Whether `derived` has to be (re)built from `source` under `options`.
    ///
    /// True when there is no entry, when the stored fingerprint differs from
    /// a fresh one, or when the derived file is absent.
    pub fn needs_regeneration(&self, source: &Path, derived: &Path, options: &Options) -> bool {
        let Some(stored) = self.entries.get(&CacheKey::new(source, derived)) else {
            return true;
        };
        match fingerprint(source, options, derived) {
            Ok(fresh) => !fresh.derived_exists() || fresh != *stored,
            Err(e) => {
                debug!(source = %source.display(), error = %e, "cannot fingerprint source, treating as stale");
                true
            }
        }
    }

    /// Fingerprint `derived` now and store it.
    ///
    /// Call only after the derived file was written successfully.
    pub fn record(&mut self, source: &Path, derived: &Path, options: &Options) -> io::Result<()> {
        let intent = WriteIntent::capture(source, derived, options)?;
        self.apply(intent);
        Ok(())
    }

    pub fn apply(&mut self, intent: WriteIntent) {
        self.entries.insert(intent.key, intent.fingerprint);
    }

    /// Apply a batch of intents, returning how many were merged.
    pub fn merge(&mut self, intents: impl IntoIterator<Item = WriteIntent>) -> usize {
        let mut merged = 0;
        for intent in intents {
            self.apply(intent);
            merged += 1;
        }
        merged
    }

    pub fn get(&self, source: &Path, derived: &Path) -> Option<&Fingerprint> {
        self.entries.get(&CacheKey::new(source, derived))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| CACHE_FILENAME.into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Resolve the cache file path for an output directory.
pub fn cache_path(output_dir: &Path) -> PathBuf {
    output_dir.join(CACHE_FILENAME)
}

/// A cache store checked out for the duration of one build.
///
/// The store is written back exactly once: by [`finish`](Self::finish), or
/// when the session is dropped on an early return, error or unwinding
/// panic.
#[derive(Debug)]
pub struct CacheSession {
    store: CacheStore,
    path: PathBuf,
    flushed: bool,
}

impl CacheSession {
    /// Load the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let store = CacheStore::load(&path)?;
        info!(path = %path.display(), entries = store.len(), "cache loaded");
        Ok(Self {
            store,
            path,
            flushed: false,
        })
    }

    /// Start from an empty store that still flushes to `path`.
    pub fn fresh(path: impl Into<PathBuf>) -> Self {
        Self {
            store: CacheStore::empty(),
            path: path.into(),
            flushed: false,
        }
    }

    pub fn store_mut(&mut self) -> &mut CacheStore {
        &mut self.store
    }

    /// Flush and close the session.
    pub fn finish(mut self) -> Result<(), CacheError> {
        self.flushed = true;
        self.store.flush(&self.path)
    }
}

impl Drop for CacheSession {
    fn drop(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;
        match self.store.flush(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "cache flushed after interrupted build"),
            Err(e) => error!(path = %self.path.display(), error = %e, "failed to flush cache"),
        }
    }
}

/// Summary of cache behaviour for a build run, counted per variant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub cached: u32,
    pub rendered: u32,
    pub failed: u32,
}

impl CacheStats {
    pub fn hit(&mut self) {
        self.cached += 1;
    }

    pub fn render(&mut self) {
        self.rendered += 1;
    }

    pub fn fail(&mut self) {
        self.failed += 1;
    }

    pub fn total(&self) -> u32 {
        self.cached + self.rendered + self.failed
    }
}

impl std::ops::AddAssign for CacheStats {
    fn add_assign(&mut self, other: Self) {
        self.cached += other.cached;
        self.rendered += other.rendered;
        self.failed += other.failed;
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = if self.failed > 0 {
            format!(", {} failed", self.failed)
        } else {
            String::new()
        };
        if self.cached > 0 {
            write!(
                f,
                "{} cached, {} rendered{} ({} total)",
                self.cached,
                self.rendered,
                failed,
                self.total()
            )
        } else {
            write!(f, "{} rendered{}", self.rendered, failed)
        }
    }
}
