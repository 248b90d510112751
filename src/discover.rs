//! Content discovery.
//!
//! Walks the content root and registers every media file found. Each
//! directory holding media is a gallery; its path relative to the root is
//! the gallery id. Hidden entries and the output directory are skipped.
//!
//! ```text
//! content/
//! ├── recitale.toml
//! ├── landscapes/
//! │   ├── dawn.jpg        → images: thumbnail per [variants].image size
//! │   └── timelapse.mp4   → videos: thumbnails + re-encodes
//! └── field-notes/
//!     └── birds.flac      → audios: one re-encode
//! ```

use crate::config::VariantsConfig;
use crate::paths;
use crate::registry::{MediaKind, Registries};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("content root {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("cannot read content root: {0}")]
    Walk(#[from] walkdir::Error),
}

/// What discovery registered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoverSummary {
    pub galleries: usize,
    pub images: usize,
    pub videos: usize,
    pub audios: usize,
    /// Regular files that are not media.
    pub ignored: usize,
}

impl DiscoverSummary {
    pub fn total(&self) -> usize {
        self.images + self.videos + self.audios
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Register every media file under `root` in `registries`.
///
/// Files are visited in sorted order, so asset ids are stable between runs.
pub fn discover(
    root: &Path,
    output_root: &Path,
    registries: &mut Registries,
    variants: &VariantsConfig,
) -> Result<DiscoverSummary, DiscoverError> {
    if !root.is_dir() {
        return Err(DiscoverError::NotADirectory(root.to_path_buf()));
    }
    let output_lexical = paths::normalize(output_root);
    let output_canonical = fs::canonicalize(output_root).ok();
    let is_output = |entry: &DirEntry| {
        entry.file_type().is_dir()
            && (paths::normalize(entry.path()) == output_lexical
                || output_canonical.is_some()
                    && fs::canonicalize(entry.path()).ok() == output_canonical)
    };

    let mut summary = DiscoverSummary::default();
    let mut galleries = BTreeSet::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e) && !is_output(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(kind) = MediaKind::from_path(entry.path()) else {
            summary.ignored += 1;
            continue;
        };
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let gallery = relative.parent().map(Path::to_path_buf).unwrap_or_default();
        let Some(filename) = relative.file_name() else {
            continue;
        };
        debug!(kind = %kind, gallery = %gallery.display(), file = %filename.to_string_lossy(), "discovered");

        let asset = registries.for_kind(kind).get(&gallery, filename);
        match kind {
            MediaKind::Image => {
                for size in &variants.image {
                    asset.thumbnail(*size);
                }
                summary.images += 1;
            }
            MediaKind::Video => {
                for size in &variants.video_thumbnail {
                    asset.thumbnail(*size);
                }
                for size in &variants.video_reencode {
                    asset.reencode(*size);
                }
                summary.videos += 1;
            }
            MediaKind::Audio => {
                if variants.audio_reencode {
                    asset.reencode(Default::default());
                }
                summary.audios += 1;
            }
        }
        galleries.insert(gallery);
    }
    summary.galleries = galleries.len();
    Ok(summary)
}
