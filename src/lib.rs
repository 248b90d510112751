//! # recitale
//!
//! The incremental media build of a gallery site generator. Given a content
//! tree of galleries, recitale produces resized image thumbnails and
//! transcoded video/audio renditions, and regenerates a derived file only
//! when its source or its rendering options changed.
//!
//! # Architecture: Two-Phase Parallel Build
//!
//! ```text
//! discover    content/     →  registries  (one per media kind, single-threaded)
//! scan        images       →  dirty list  (parallel, header probe only)
//! render      dirty list   →  files + write-intents   (parallel)
//! encode      video, audio →  files + write-intents   (sequential, ffmpeg)
//! flush       write-intents merged → .recitale-cache.json
//! ```
//!
//! The scan phase exists because most assets are usually up to date. A probe
//! is cheap, and the render pool only ever sees assets with real work, so
//! workers do not idle behind a long tail of cache hits.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`options`] | Opaque rendering option sets, superficial-key stripping, digests |
//! | [`fingerprint`] | Signature of a (source, options, derived) triple |
//! | [`cache`] | Persistent cache store, write-intents, scoped flush, statistics |
//! | [`registry`] | Per-kind asset registries, base assets and their variants |
//! | [`discover`] | Walks the content root and fills the registries |
//! | [`imaging`] | Pure-Rust probe, decode, orient, resize, encode |
//! | [`ffmpeg`] | External encoder command templates and runner |
//! | [`pipeline`] | Scan, render and encode phases plus the coordinator |
//! | [`progress`] | Single-consumer progress aggregation per phase |
//! | [`config`] | `recitale.toml` loading, merging, validation |
//! | [`output`] | CLI output formatting |
//! | [`paths`] | Lexical path normalization |
//!
//! # Design Decisions
//!
//! ## Workers Never Write the Cache
//!
//! Every worker looks up against the same immutable cache snapshot and
//! returns [`cache::WriteIntent`]s in its report. The coordinator merges them
//! after each phase, and the store is flushed once at the end, or on any exit
//! path through [`cache::CacheSession`]'s `Drop`. No locks are held around
//! the cache while pixels are being pushed.
//!
//! ## Superficial Options
//!
//! Display-only keys (`name`, `text`, `exif`, ...) are stripped before
//! fingerprinting, so editing a caption does not re-encode a 40 MB photo.
//! See [`options::SUPERFICIAL_KEYS`].
//!
//! ## Derived Files Are Observed, Not Trusted
//!
//! A fingerprint includes the modification time and length of the derived
//! file itself. Deleting or replacing an output is a cache miss even though
//! the cache entry is still there.

pub mod cache;
pub mod config;
pub mod discover;
pub mod ffmpeg;
pub mod fingerprint;
pub mod imaging;
pub mod options;
pub mod output;
pub mod paths;
pub mod pipeline;
pub mod progress;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_helpers;
