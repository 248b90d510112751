//! Sequential encoders for video and audio assets.
//!
//! These assets skip the scan phase: the encoder re-checks every variant
//! itself, runs nothing when all are fresh, and otherwise runs one command
//! per re-encode plus one multi-output command for all stale thumbnails.
//! A failed command stops the asset; the others continue.

use super::{RenderReport, RenderStrategy};
use crate::cache::{CacheStore, WriteIntent};
use crate::ffmpeg::{
    CommandRunner, EncodeError, EncoderCommand, audio_reencode_command, video_reencode_command,
    video_thumbnail_command,
};
use crate::registry::{BaseAsset, Variant, VariantRole};
use tracing::{debug, error};

fn prepare_dirs(variants: &[&Variant]) -> Result<(), String> {
    for variant in variants {
        if let Some(parent) = variant.dest().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
        }
    }
    Ok(())
}

fn run(
    runner: &dyn CommandRunner,
    variants: &[&Variant],
    command: Result<EncoderCommand, EncodeError>,
) -> Result<(), String> {
    prepare_dirs(variants)?;
    let command = command.map_err(|e| e.to_string())?;
    debug!(command = %command, "encoding");
    runner.run(&command).map_err(|e| e.to_string())
}

/// Record a produced file, or fail the asset when it did not appear.
fn record(report: &mut RenderReport, asset: &BaseAsset, variant: &Variant) -> bool {
    match WriteIntent::capture(asset.source(), variant.dest(), asset.options()) {
        Ok(intent) => {
            report.rendered(variant, intent);
            true
        }
        Err(e) => {
            fail(report, asset, Some(variant), e.to_string());
            false
        }
    }
}

fn fail(report: &mut RenderReport, asset: &BaseAsset, variant: Option<&Variant>, e: String) {
    error!(
        source = %asset.source().display(),
        dest = %variant.map(|v| v.dest().display().to_string()).unwrap_or_default(),
        error = %e,
        "encoder failed"
    );
    report.failed(variant, e);
}

/// Split variants into cached (reported) and stale.
fn stale_variants<'v>(
    asset: &'v BaseAsset,
    cache: &CacheStore,
    report: &mut RenderReport,
) -> Vec<&'v Variant> {
    let mut stale = Vec::new();
    for variant in asset.variants() {
        if cache.needs_regeneration(asset.source(), variant.dest(), asset.options()) {
            stale.push(variant);
        } else {
            report.cached(variant);
        }
    }
    stale
}

/// Video re-encodes and frame thumbnails.
pub struct VideoEncoder<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> VideoEncoder<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl RenderStrategy for VideoEncoder<'_> {
    fn render(&self, asset: &BaseAsset, cache: &CacheStore) -> RenderReport {
        let mut report = RenderReport::new(asset);
        let stale = stale_variants(asset, cache, &mut report);
        let (thumbnails, reencodes): (Vec<&Variant>, Vec<&Variant>) = stale
            .into_iter()
            .partition(|v| v.role() == VariantRole::Thumbnail);

        for (i, &variant) in reencodes.iter().enumerate() {
            let outcome = run(
                self.runner,
                &[variant],
                video_reencode_command(asset, variant),
            );
            let recorded = match outcome {
                Ok(()) => record(&mut report, asset, variant),
                Err(e) => {
                    fail(&mut report, asset, Some(variant), e);
                    false
                }
            };
            if !recorded {
                report.skipped(reencodes[i + 1..].iter().copied());
                report.skipped(thumbnails.iter().copied());
                return report;
            }
        }

        if thumbnails.is_empty() {
            return report;
        }
        match run(
            self.runner,
            &thumbnails,
            video_thumbnail_command(asset, &thumbnails),
        ) {
            Ok(()) => {
                for (i, &variant) in thumbnails.iter().enumerate() {
                    if !record(&mut report, asset, variant) {
                        report.skipped(thumbnails[i + 1..].iter().copied());
                        break;
                    }
                }
            }
            Err(e) => {
                // One command produced every thumbnail
                fail(&mut report, asset, thumbnails.first().copied(), e);
                report.skipped(thumbnails.iter().skip(1).copied());
            }
        }
        report
    }
}

/// Audio re-encodes.
pub struct AudioEncoder<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> AudioEncoder<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl RenderStrategy for AudioEncoder<'_> {
    fn render(&self, asset: &BaseAsset, cache: &CacheStore) -> RenderReport {
        let mut report = RenderReport::new(asset);
        let stale = stale_variants(asset, cache, &mut report);
        for (i, &variant) in stale.iter().enumerate() {
            let outcome = run(
                self.runner,
                &[variant],
                audio_reencode_command(asset, variant),
            );
            let recorded = match outcome {
                Ok(()) => record(&mut report, asset, variant),
                Err(e) => {
                    fail(&mut report, asset, Some(variant), e);
                    false
                }
            };
            if !recorded {
                report.skipped(stale[i + 1..].iter().copied());
                break;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::tests::MockRunner;
    use crate::options::Options;
    use crate::pipeline::VariantStatus;
    use crate::registry::TargetSize;
    use crate::test_helpers::TestSite;

    fn video_asset(site: &TestSite) -> BaseAsset {
        site.write("g/clip.mp4", b"video");
        let mut registries = site.registries();
        let asset = registries.videos.get("g", "clip.mp4");
        asset.reencode(TargetSize::new(Some(1280), Some(720)));
        asset.reencode(TargetSize::new(Some(640), Some(360)));
        asset.thumbnail(TargetSize::height(900));
        asset.thumbnail(TargetSize::width(300));
        asset.clone()
    }

    fn statuses(report: &RenderReport) -> Vec<VariantStatus> {
        report.variants.iter().map(|v| v.status.clone()).collect()
    }

    // =========================================================================
    // Video
    // =========================================================================

    #[test]
    fn one_command_per_reencode_and_one_for_thumbnails() {
        let site = TestSite::new();
        let asset = video_asset(&site);
        let runner = MockRunner::new();
        let report = VideoEncoder::new(&runner).render(&asset, &CacheStore::empty());

        assert_eq!(runner.commands().len(), 3);
        assert_eq!(report.intents.len(), 4);
        assert!(!report.is_failure());
        for variant in asset.variants() {
            assert!(variant.dest().exists());
        }
    }

    #[test]
    fn fresh_video_runs_nothing() {
        let site = TestSite::new();
        let asset = video_asset(&site);
        let runner = MockRunner::new();
        let encoder = VideoEncoder::new(&runner);
        let first = encoder.render(&asset, &CacheStore::empty());
        let mut cache = CacheStore::empty();
        cache.merge(first.intents);

        let second = encoder.render(&asset, &cache);
        assert_eq!(runner.commands().len(), 3);
        assert_eq!(second.stats().cached, 4);
    }

    #[test]
    fn only_stale_thumbnails_are_extracted() {
        let site = TestSite::new();
        let asset = video_asset(&site);
        let runner = MockRunner::new();
        let encoder = VideoEncoder::new(&runner);
        let mut cache = CacheStore::empty();
        cache.merge(encoder.render(&asset, &CacheStore::empty()).intents);

        let thumb = asset
            .variants()
            .find(|v| v.role() == VariantRole::Thumbnail)
            .unwrap()
            .dest()
            .to_path_buf();
        std::fs::remove_file(&thumb).unwrap();

        let report = encoder.render(&asset, &cache);
        let commands = runner.commands();
        assert_eq!(commands.len(), 4);
        let last = commands.last().unwrap().args_lossy();
        assert_eq!(last.iter().filter(|a| *a == "-frames:v").count(), 1);
        assert_eq!(report.intents.len(), 1);
        assert!(thumb.exists());
    }

    #[test]
    fn failed_reencode_skips_remaining_variants() {
        let site = TestSite::new();
        let asset = video_asset(&site);
        let runner = MockRunner::new();
        runner.fail_when_contains("scale=1280:720");
        let report = VideoEncoder::new(&runner).render(&asset, &CacheStore::empty());

        assert!(report.is_failure());
        assert!(report.failure.as_deref().unwrap().contains("mock failure"));
        let st = statuses(&report);
        assert_eq!(st.iter().filter(|s| matches!(s, VariantStatus::Failed(_))).count(), 1);
        assert_eq!(st.iter().filter(|s| **s == VariantStatus::Skipped).count(), 3);
        assert!(report.intents.is_empty());
    }

    #[test]
    fn failed_thumbnail_command_fails_all_thumbnails() {
        let site = TestSite::new();
        let asset = video_asset(&site);
        let runner = MockRunner::new();
        runner.fail_when_contains("-frames:v");
        let report = VideoEncoder::new(&runner).render(&asset, &CacheStore::empty());

        assert_eq!(report.intents.len(), 2);
        assert!(report.is_failure());
        assert_eq!(report.stats().failed, 2);
    }

    #[test]
    fn changed_encoder_options_produce_new_files() {
        let site = TestSite::new();
        site.write("g/clip.mp4", b"video");
        let mut registries = site.registries();
        let low = registries
            .videos
            .get_with("g", "clip.mp4", &Options::new().with("vbitrate", "500k"));
        let low_dest = low.reencode(TargetSize::width(640)).dest().to_path_buf();
        let high = registries
            .videos
            .get_with("g", "clip.mp4", &Options::new().with("vbitrate", "8000k"));
        let high_dest = high.reencode(TargetSize::width(640)).dest().to_path_buf();
        assert_ne!(low_dest, high_dest);
    }

    // =========================================================================
    // Audio
    // =========================================================================

    #[test]
    fn audio_encodes_and_then_stays_cached() {
        let site = TestSite::new();
        site.write("g/song.flac", b"audio");
        let mut registries = site.registries();
        let asset = registries.audios.get("g", "song.flac");
        asset.reencode(TargetSize::default());
        let asset = asset.clone();

        let runner = MockRunner::new();
        let encoder = AudioEncoder::new(&runner);
        let first = encoder.render(&asset, &CacheStore::empty());
        assert_eq!(first.intents.len(), 1);
        assert!(first.intents[0].key.derived.ends_with(".mp3"));

        let mut cache = CacheStore::empty();
        cache.merge(first.intents);
        let second = encoder.render(&asset, &cache);
        assert_eq!(second.stats().cached, 1);
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn audio_failure_is_reported() {
        let site = TestSite::new();
        site.write("g/song.flac", b"audio");
        let mut registries = site.registries();
        let asset = registries.audios.get("g", "song.flac");
        asset.reencode(TargetSize::default());
        let asset = asset.clone();

        let runner = MockRunner::new();
        runner.fail_when_contains("song.flac");
        let report = AudioEncoder::new(&runner).render(&asset, &CacheStore::empty());
        assert!(report.is_failure());
        assert!(report.intents.is_empty());
    }
}
