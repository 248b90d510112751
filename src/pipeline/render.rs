//! Render phase: decode once, write every stale variant.
//!
//! Saves return a typed [`SaveError`]. Buffer exhaustion and metadata
//! failures get exactly one retry with adjusted parameters; anything else
//! stops the asset, and its remaining variants are reported as skipped.

use super::scan::effective_image_options;
use super::{RenderReport, RenderStrategy};
use crate::cache::{CacheStore, WriteIntent};
use crate::imaging::{
    ImageBackend, Quality, RetryAdjustment, SaveError, SaveParams, enlarged_buffer, exif, orient,
    resize_to,
};
use crate::registry::{BaseAsset, Variant};
use image::DynamicImage;
use tracing::{debug, error, warn};

/// Renders image variants through an [`ImageBackend`].
pub struct ImageRenderer<'a> {
    backend: &'a dyn ImageBackend,
    encode_buffer: usize,
}

/// Per-asset settings shared by every variant save.
struct SaveSettings {
    quality: Quality,
    progressive: bool,
    buffer_limit: usize,
    exif: Option<Vec<u8>>,
    icc_len: usize,
    /// Set when metadata had to be dropped before the first save.
    degraded: Option<String>,
}

impl<'a> ImageRenderer<'a> {
    pub fn new(backend: &'a dyn ImageBackend, encode_buffer: usize) -> Self {
        Self {
            backend,
            encode_buffer,
        }
    }

    /// Save once, and once more if the error says an adjustment helps.
    ///
    /// Returns the degradation reason when the retry dropped metadata.
    fn save_with_retry(
        &self,
        image: &DynamicImage,
        mut params: SaveParams,
        icc_len: usize,
    ) -> Result<Option<String>, SaveError> {
        let err = match self.backend.save(image, &params) {
            Ok(()) => return Ok(None),
            Err(err) => err,
        };
        let Some(adjustment) = err.retry_adjustment() else {
            return Err(err);
        };

        let degraded = match adjustment {
            RetryAdjustment::EnlargeBuffer => {
                let current = params.buffer_limit.unwrap_or(0);
                let limit = enlarged_buffer(current, (image.width(), image.height()), icc_len);
                debug!(dest = %params.output.display(), from = current, to = limit, "retrying with larger buffer");
                params.buffer_limit = Some(limit);
                None
            }
            RetryAdjustment::StripMetadata => {
                warn!(dest = %params.output.display(), error = %err, "retrying without metadata");
                params.exif = None;
                Some(format!("metadata stripped: {err}"))
            }
        };
        self.backend.save(image, &params)?;
        Ok(degraded)
    }

    /// Prepare the metadata block that goes into every output.
    fn metadata_for(&self, asset: &BaseAsset, exif_block: Option<Vec<u8>>, oriented: bool) -> (Option<Vec<u8>>, Option<String>) {
        if asset.options().flag("strip") {
            return (None, None);
        }
        let Some(mut block) = exif_block else {
            return (None, None);
        };
        if !oriented {
            return (Some(block), None);
        }
        // Pixels are upright now; a kept tag must say so
        match exif::reset_orientation(&mut block) {
            Ok(_) => (Some(block), None),
            Err(e) => {
                warn!(source = %asset.source().display(), error = %e, "malformed EXIF, stripping metadata");
                (None, Some(format!("metadata stripped: {e}")))
            }
        }
    }

    fn save_variant(
        &self,
        variant: &Variant,
        pixels: &DynamicImage,
        settings: &SaveSettings,
    ) -> Result<Option<String>, String> {
        if let Some(parent) = variant.dest().parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
        }
        let resized = resize_to(pixels, variant.size());
        let params = SaveParams::new(variant.dest(), settings.quality)
            .with_progressive(settings.progressive)
            .with_buffer_limit(Some(settings.buffer_limit))
            .with_exif(settings.exif.clone());
        let degraded = self
            .save_with_retry(&resized, params, settings.icc_len)
            .map_err(|e| e.to_string())?;
        Ok(degraded.or_else(|| settings.degraded.clone()))
    }
}

impl RenderStrategy for ImageRenderer<'_> {
    fn render(&self, asset: &BaseAsset, cache: &CacheStore) -> RenderReport {
        let mut report = RenderReport::new(asset);
        let source = asset.source();

        let probe = match self.backend.probe(source) {
            Ok(probe) => probe,
            Err(e) => {
                error!(source = %source.display(), error = %e, "cannot read image");
                report.failed(None, e.to_string());
                report.skipped(asset.variants());
                return report;
            }
        };
        let options = effective_image_options(asset.options(), &probe);

        let mut stale = Vec::new();
        for variant in asset.variants() {
            if cache.needs_regeneration(source, variant.dest(), &options) {
                stale.push(variant);
            } else {
                report.cached(variant);
            }
        }
        if stale.is_empty() {
            return report;
        }

        let decoded = match self.backend.decode(source) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(source = %source.display(), error = %e, "cannot decode image");
                report.failed(None, e.to_string());
                report.skipped(stale);
                return report;
            }
        };

        let mut pixels = decoded.pixels;
        let oriented = asset.options().flag("auto-orient") && orient(&mut pixels, decoded.orientation);
        let (exif_block, degraded) = self.metadata_for(asset, decoded.exif, oriented);
        let settings = SaveSettings {
            quality: Quality::from_options(asset.options()),
            progressive: asset.options().flag("progressive"),
            buffer_limit: self.encode_buffer,
            exif: exif_block,
            icc_len: decoded.icc_len,
            degraded,
        };

        for (i, &variant) in stale.iter().enumerate() {
            let result = self
                .save_variant(variant, &pixels, &settings)
                .and_then(|degraded| {
                    WriteIntent::capture(source, variant.dest(), &options)
                        .map(|intent| (intent, degraded))
                        .map_err(|e| e.to_string())
                });
            match result {
                Ok((intent, None)) => report.rendered(variant, intent),
                Ok((intent, Some(reason))) => report.degraded(variant, intent, reason),
                Err(e) => {
                    error!(
                        source = %source.display(),
                        dest = %variant.dest().display(),
                        error = %e,
                        "failed to write variant"
                    );
                    report.failed(Some(variant), e);
                    report.skipped(stale[i + 1..].iter().copied());
                    break;
                }
            }
        }
        report
    }
}
