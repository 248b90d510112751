//! Build-scoped asset registries.
//!
//! Page assembly (or, in this crate, [`crate::discover`]) asks for media by
//! `(gallery, filename)` and declares which derived variants it needs. The
//! registry hands back the same [`BaseAsset`] for every spelling of the same
//! file, so two pages that embed one photo at the same size ask for one
//! thumbnail and the pipeline renders it once.
//!
//! There is one [`AssetRegistry`] per media kind, bundled in
//! [`Registries`]. They are plain values owned by the build: filled
//! single-threaded during discovery, then only read by the pipeline.
//!
//! ## Identity
//!
//! An asset is keyed by its lexically normalized path relative to the content
//! root plus the digest of its effective options. The same path with the same
//! options is always the same instance; the same file requested with
//! different encoder options (via [`AssetRegistry::get_with`]) is a
//! different asset with its own derived files.
//!
//! ## Derived names
//!
//! | Kind  | Variant   | File name                              |
//! |-------|-----------|----------------------------------------|
//! | image | thumbnail | `{stem}-{checksum}-{size}.{ext}`       |
//! | video | thumbnail | `{stem}-{checksum}-{size}.jpg`         |
//! | video | reencode  | `{stem}-{checksum}-{size}.{extension}` |
//! | audio | reencode  | `{stem}-{checksum}.{extension}`        |
//!
//! `{size}` is the target size label (`1200x900`, `x900`, `1200x`) and
//! `{checksum}` the short options digest. An image keeps its source
//! extension, case included. When the output format differs (TIFF is
//! written as JPEG) the source extension joins the stem instead, so
//! `a.tif` becomes `a-tif-{checksum}-{size}.jpg` and never meets `a.jpg`.
//! Derived files land under the output root at the asset's relative
//! directory.
//!
//! Names can still meet for contrived file names (`a-tif.jpg` next to
//! `a.tif`). [`Registries::check_destinations`] finds those before any
//! work starts.

use crate::config::SiteConfig;
use crate::options::Options;
use crate::paths;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Media kinds handled by the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "tif", "tiff"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "mov", "webm", "mkv", "avi", "ogv"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "ogg", "oga", "wav", "flac", "m4a", "opus", "aac"];

impl MediaKind {
    /// Classify a file by extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Audio)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid size {0:?}: expected WxH, Wx or xH")]
pub struct SizeParseError(String);

/// Requested bounding box of a variant. Unset dimensions are unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct TargetSize {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl TargetSize {
    pub fn new(width: Option<u32>, height: Option<u32>) -> Self {
        Self { width, height }
    }

    pub fn width(width: u32) -> Self {
        Self::new(Some(width), None)
    }

    pub fn height(height: u32) -> Self {
        Self::new(None, Some(height))
    }

    pub fn is_unconstrained(&self) -> bool {
        self.width.is_none() && self.height.is_none()
    }

    /// `WxH` with unset dimensions left empty: `1200x900`, `x900`, `1200x`.
    pub fn label(&self) -> String {
        let w = self.width.map(|w| w.to_string()).unwrap_or_default();
        let h = self.height.map(|h| h.to_string()).unwrap_or_default();
        format!("{w}x{h}")
    }
}

impl fmt::Display for TargetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for TargetSize {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || SizeParseError(s.to_string());
        let (w, h) = s.trim().split_once('x').ok_or_else(err)?;
        let parse = |part: &str| -> Result<Option<u32>, SizeParseError> {
            if part.is_empty() {
                return Ok(None);
            }
            match part.parse::<u32>() {
                Ok(0) | Err(_) => Err(err()),
                Ok(n) => Ok(Some(n)),
            }
        };
        let size = TargetSize::new(parse(w)?, parse(h)?);
        if size.is_unconstrained() {
            return Err(err());
        }
        Ok(size)
    }
}

impl serde::Serialize for TargetSize {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> serde::Deserialize<'de> for TargetSize {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What a variant is made by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantRole {
    /// A still image: a resized photo, or a frame grabbed from a video.
    Thumbnail,
    /// A transcoded copy of a video or audio source.
    Reencode,
}

/// One derived file of a base asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    name: String,
    role: VariantRole,
    size: TargetSize,
    dest: PathBuf,
}

impl Variant {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> VariantRole {
        self.role
    }

    pub fn size(&self) -> TargetSize {
        self.size
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }
}

/// Index of an asset within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(usize);

/// A source media file plus the derived variants requested for it.
#[derive(Debug, Clone)]
pub struct BaseAsset {
    id: AssetId,
    kind: MediaKind,
    relative: PathBuf,
    source: PathBuf,
    dest_dir: PathBuf,
    options: Options,
    checksum: String,
    variants: BTreeMap<PathBuf, Variant>,
}

impl BaseAsset {
    pub fn id(&self) -> AssetId {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Normalized path relative to the content root.
    pub fn relative_path(&self) -> &Path {
        &self.relative
    }

    /// Path of the source file on disk.
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Variants in destination order. One entry per destination path.
    pub fn variants(&self) -> impl Iterator<Item = &Variant> {
        self.variants.values()
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// Request a still-image variant at `size`.
    ///
    /// Requesting the same size twice returns the existing variant.
    pub fn thumbnail(&mut self, size: TargetSize) -> &Variant {
        let file_name = match self.kind {
            MediaKind::Image => self.image_file_name(size),
            MediaKind::Video | MediaKind::Audio => {
                format!("{}-{}-{}.jpg", self.stem(), self.checksum, size)
            }
        };
        self.insert_variant(VariantRole::Thumbnail, size, file_name)
    }

    /// Request a transcoded variant.
    ///
    /// Audio renditions ignore `size`; video renditions are scaled to it.
    pub fn reencode(&mut self, size: TargetSize) -> &Variant {
        let ext = self
            .options
            .str("extension")
            .map(str::to_string)
            .unwrap_or_else(|| source_extension(&self.source).to_lowercase());
        let file_name = match self.kind {
            MediaKind::Audio => format!("{}-{}.{}", self.stem(), self.checksum, ext),
            MediaKind::Video => format!("{}-{}-{}.{}", self.stem(), self.checksum, size, ext),
            MediaKind::Image => self.image_file_name(size),
        };
        let size = if self.kind == MediaKind::Audio {
            TargetSize::default()
        } else {
            size
        };
        self.insert_variant(VariantRole::Reencode, size, file_name)
    }

    fn image_file_name(&self, size: TargetSize) -> String {
        let source_ext = source_extension(&self.source);
        match image_output_extension(&source_ext) {
            Some(ext) => format!("{}-{}-{}.{}", self.stem(), self.checksum, size, ext),
            None if source_ext.is_empty() => format!("{}-{}-{}.jpg", self.stem(), self.checksum, size),
            None => format!("{}-{}-{}-{}.jpg", self.stem(), source_ext, self.checksum, size),
        }
    }

    fn insert_variant(&mut self, role: VariantRole, size: TargetSize, file_name: String) -> &Variant {
        let dest = self.dest_dir.join(&file_name);
        let name = match role {
            VariantRole::Thumbnail => format!("thumbnail {size}"),
            VariantRole::Reencode if size.is_unconstrained() => "reencode".to_string(),
            VariantRole::Reencode => format!("reencode {size}"),
        };
        self.variants.entry(dest.clone()).or_insert(Variant {
            name,
            role,
            size,
            dest,
        })
    }

    fn stem(&self) -> String {
        self.source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn source_extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The source extension, when a resized image can be written with it.
/// `None` means the output is JPEG under a different extension.
fn image_output_extension(source_ext: &str) -> Option<&str> {
    match source_ext.to_lowercase().as_str() {
        "jpg" | "jpeg" | "png" | "webp" => Some(source_ext),
        _ => None,
    }
}

/// All base assets of one media kind for one build.
#[derive(Debug)]
pub struct AssetRegistry {
    kind: MediaKind,
    content_root: PathBuf,
    output_root: PathBuf,
    defaults: Options,
    assets: Vec<BaseAsset>,
    index: HashMap<(PathBuf, String), AssetId>,
}

impl AssetRegistry {
    pub fn new(
        kind: MediaKind,
        content_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        defaults: Options,
    ) -> Self {
        Self {
            kind,
            content_root: content_root.into(),
            output_root: output_root.into(),
            defaults,
            assets: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Look up or create the asset for `filename` inside `gallery`, with the
    /// registry's default options.
    pub fn get(&mut self, gallery: impl AsRef<Path>, filename: impl AsRef<Path>) -> &mut BaseAsset {
        self.get_with(gallery, filename, &Options::new())
    }

    /// Like [`get`](Self::get), with `overrides` merged onto the defaults.
    pub fn get_with(
        &mut self,
        gallery: impl AsRef<Path>,
        filename: impl AsRef<Path>,
        overrides: &Options,
    ) -> &mut BaseAsset {
        let relative = paths::normalize(&gallery.as_ref().join(filename.as_ref()));
        let options = self.defaults.merged(overrides);
        let key = (relative.clone(), options.digest());

        if let Some(&id) = self.index.get(&key) {
            return &mut self.assets[id.0];
        }

        let id = AssetId(self.assets.len());
        let dest_dir = match relative.parent() {
            Some(parent) => self.output_root.join(parent),
            None => self.output_root.clone(),
        };
        let checksum = options.checksum();
        self.assets.push(BaseAsset {
            id,
            kind: self.kind,
            source: self.content_root.join(&relative),
            relative,
            dest_dir,
            options,
            checksum,
            variants: BTreeMap::new(),
        });
        self.index.insert(key, id);
        &mut self.assets[id.0]
    }

    pub fn asset(&self, id: AssetId) -> Option<&BaseAsset> {
        self.assets.get(id.0)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BaseAsset> {
        self.assets.iter()
    }

    /// All assets in registration order.
    pub fn assets(&self) -> &[BaseAsset] {
        &self.assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Total number of variants across all assets.
    pub fn variant_count(&self) -> usize {
        self.assets.iter().map(BaseAsset::variant_count).sum()
    }
}

impl<'a> IntoIterator for &'a AssetRegistry {
    type Item = &'a BaseAsset;
    type IntoIter = std::slice::Iter<'a, BaseAsset>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The three per-kind registries of one build.
#[derive(Debug)]
pub struct Registries {
    pub images: AssetRegistry,
    pub videos: AssetRegistry,
    pub audios: AssetRegistry,
}

impl Registries {
    /// Empty registries whose default options come from `config`.
    pub fn new(content_root: &Path, output_root: &Path, config: &SiteConfig) -> Self {
        Self {
            images: AssetRegistry::new(
                MediaKind::Image,
                content_root,
                output_root,
                config.image.to_options(),
            ),
            videos: AssetRegistry::new(
                MediaKind::Video,
                content_root,
                output_root,
                config.video.to_options(),
            ),
            audios: AssetRegistry::new(
                MediaKind::Audio,
                content_root,
                output_root,
                config.audio.to_options(),
            ),
        }
    }

    pub fn for_kind(&mut self, kind: MediaKind) -> &mut AssetRegistry {
        match kind {
            MediaKind::Image => &mut self.images,
            MediaKind::Video => &mut self.videos,
            MediaKind::Audio => &mut self.audios,
        }
    }

    /// Fail when two variants anywhere in the build write the same file.
    pub fn check_destinations(&self) -> Result<(), DestinationConflict> {
        let mut owners: HashMap<&Path, &BaseAsset> = HashMap::new();
        for asset in self.images.iter().chain(&self.videos).chain(&self.audios) {
            for variant in asset.variants() {
                if let Some(first) = owners.insert(variant.dest(), asset) {
                    return Err(DestinationConflict {
                        dest: variant.dest().to_path_buf(),
                        first: first.relative_path().to_path_buf(),
                        second: asset.relative_path().to_path_buf(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Two assets whose derived files would overwrite each other.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("{} and {} would both write {}", .first.display(), .second.display(), .dest.display())]
pub struct DestinationConflict {
    pub dest: PathBuf,
    pub first: PathBuf,
    pub second: PathBuf,
}
