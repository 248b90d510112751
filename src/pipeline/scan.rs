//! Scan phase: cheap classification of image assets.
//!
//! The scan opens each source once (a header probe, no pixel decode),
//! computes the effective options once, and asks the cache about each
//! variant until the first stale one. Only dirty assets go on to the render
//! phase.

use crate::cache::CacheStore;
use crate::imaging::{ImageBackend, ImageProbe};
use crate::options::Options;
use crate::registry::{BaseAsset, MediaKind};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every variant is up to date.
    Cached,
    /// At least one variant needs regeneration.
    Dirty,
}

/// Options an image's derived files are fingerprinted with.
///
/// Superficial keys are dropped. The detected source format is added, and
/// when metadata is kept, a digest of the EXIF block, so that editing the
/// metadata of a source invalidates its derived files.
pub fn effective_image_options(options: &Options, probe: &ImageProbe) -> Options {
    let mut effective = options.without_superficial();
    effective.insert("format", probe.format.extensions_str().first().copied().unwrap_or("unknown"));
    if !options.flag("strip")
        && let Some(exif) = &probe.exif
    {
        effective.insert("metadata", format!("{:x}", Sha256::digest(exif)));
    }
    effective
}

/// Classify one image asset.
///
/// A source that cannot be probed is dirty; the render phase reports the
/// failure.
pub fn scan_asset(asset: &BaseAsset, backend: &dyn ImageBackend, cache: &CacheStore) -> ScanOutcome {
    let probe = match backend.probe(asset.source()) {
        Ok(probe) => probe,
        Err(e) => {
            debug!(source = %asset.source().display(), error = %e, "probe failed during scan");
            return ScanOutcome::Dirty;
        }
    };
    let options = effective_image_options(asset.options(), &probe);
    let stale = asset
        .variants()
        .any(|v| cache.needs_regeneration(asset.source(), v.dest(), &options));
    if stale {
        ScanOutcome::Dirty
    } else {
        ScanOutcome::Cached
    }
}

/// Cache state of one variant, for `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantState {
    pub name: String,
    pub dest: PathBuf,
    pub fresh: bool,
}

/// Cache state of every variant of `asset` without short-circuiting.
///
/// Images use their effective options; video and audio use their asset
/// options as-is. An unreadable image reports every variant stale.
pub fn variant_states(
    asset: &BaseAsset,
    backend: &dyn ImageBackend,
    cache: &CacheStore,
) -> Vec<VariantState> {
    let options = match asset.kind() {
        MediaKind::Image => match backend.probe(asset.source()) {
            Ok(probe) => Some(effective_image_options(asset.options(), &probe)),
            Err(_) => None,
        },
        MediaKind::Video | MediaKind::Audio => Some(asset.options().clone()),
    };
    asset
        .variants()
        .map(|v| VariantState {
            name: v.name().to_string(),
            dest: v.dest().to_path_buf(),
            fresh: options
                .as_ref()
                .is_some_and(|o| !cache.needs_regeneration(asset.source(), v.dest(), o)),
        })
        .collect()
}
