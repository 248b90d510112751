//! Lexical path normalization.
//!
//! Registry identities and cache keys are built from paths relative to the
//! content root. Two spellings of the same file (`light/../gallery/a.jpg` and
//! `gallery/a.jpg`) must map to the same key, without touching the
//! filesystem: derived files and even sources may not exist yet when a key is
//! computed.

use std::path::{Component, Path, PathBuf};

/// Resolve `.` and `..` components lexically.
///
/// `..` at the top of a relative path is clamped: a path cannot climb above
/// the root it is relative to, so `../a.jpg` normalizes to `a.jpg`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // pop() refuses to remove a root or prefix, which is the clamp
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Stable string form of a normalized path, always `/`-separated.
///
/// Used as the on-disk cache key so a cache file written on one platform
/// reads the same on another.
pub fn key_string(path: &Path) -> String {
    let normalized = normalize(path);
    let parts: Vec<String> = normalized
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if normalized.has_root() && parts.first().is_some_and(|p| p == "/") {
        format!("/{}", parts[1..].join("/"))
    } else {
        parts.join("/")
    }
}
