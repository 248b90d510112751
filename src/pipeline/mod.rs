//! The incremental build pipeline.
//!
//! ```text
//! images:  scan (parallel, probe only) ─→ dirty list ─→ render (parallel)
//!                                                         │ write-intents
//!                                                         ▼
//!                                               coordinator merges into cache
//! video:   sequential encoder, one asset at a time ──────→ merge
//! audio:   sequential encoder, one asset at a time ──────→ merge
//! ```
//!
//! Workers only read the cache. Every worker returns a [`RenderReport`]
//! carrying the [`WriteIntent`]s of the files it produced, and the
//! coordinator merges them into the cache after each phase. Worker failures,
//! panics included, become failed reports and never cancel siblings.
//!
//! Every kind of asset is rendered through the [`RenderStrategy`] trait:
//! [`ImageRenderer`] for images, [`VideoEncoder`] and [`AudioEncoder`] for
//! the external transcoder.

mod encode;
mod render;
mod scan;

pub use encode::{AudioEncoder, VideoEncoder};
pub use render::ImageRenderer;
pub use scan::{ScanOutcome, VariantState, effective_image_options, scan_asset, variant_states};

use crate::cache::{CacheError, CacheSession, CacheStats, CacheStore, WriteIntent};
use crate::ffmpeg::{CommandRunner, EncoderAvailability};
use crate::imaging::ImageBackend;
use crate::progress::{ProgressAggregator, ProgressSink, TerminalSink};
use crate::registry::{AssetRegistry, BaseAsset, DestinationConflict, MediaKind, Registries, Variant};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("cannot start progress reporting: {0}")]
    Progress(#[source] std::io::Error),
    #[error("build interrupted ({merged} cache entries kept)")]
    Interrupted { merged: usize },
    #[error(transparent)]
    DuplicateDestination(#[from] DestinationConflict),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Flush `session` once a run has ended, however it ended.
///
/// The run's own error wins: a flush failure after a failed run is logged
/// and the run's error is returned.
pub fn close_session<T>(session: CacheSession, outcome: Result<T, PipelineError>) -> Result<T, PipelineError> {
    match (session.finish(), outcome) {
        (Ok(()), outcome) => outcome,
        (Err(flush), Ok(_)) => Err(flush.into()),
        (Err(flush), Err(run)) => {
            error!(error = %flush, "failed to flush cache");
            Err(run)
        }
    }
}

/// Builds the progress display of one phase from its label.
pub type SinkFactory<'a> = Box<dyn Fn(&str) -> Box<dyn ProgressSink> + Sync + 'a>;

/// Set from the Ctrl-C handler, observed before each item starts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantStatus {
    Cached,
    Rendered,
    /// Rendered after a fallback, e.g. with metadata stripped.
    Degraded(String),
    Failed(String),
    /// Not attempted because an earlier variant of the asset failed.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct VariantReport {
    pub name: String,
    pub dest: PathBuf,
    pub status: VariantStatus,
}

/// Outcome of rendering one base asset.
#[derive(Debug)]
pub struct RenderReport {
    pub kind: MediaKind,
    pub source: PathBuf,
    pub variants: Vec<VariantReport>,
    pub intents: Vec<WriteIntent>,
    /// First error that stopped the asset, if any.
    pub failure: Option<String>,
}

impl RenderReport {
    pub fn new(asset: &BaseAsset) -> Self {
        Self {
            kind: asset.kind(),
            source: asset.source().to_path_buf(),
            variants: Vec::new(),
            intents: Vec::new(),
            failure: None,
        }
    }

    /// A worker panic: nothing it produced is trusted.
    pub fn panicked(asset: &BaseAsset, message: &str) -> Self {
        let mut report = Self::new(asset);
        let mut variants = asset.variants();
        report.failed(variants.next(), format!("worker panicked: {message}"));
        report.skipped(variants);
        report
    }

    fn push(&mut self, variant: &Variant, status: VariantStatus) {
        self.variants.push(VariantReport {
            name: variant.name().to_string(),
            dest: variant.dest().to_path_buf(),
            status,
        });
    }

    pub fn cached(&mut self, variant: &Variant) {
        self.push(variant, VariantStatus::Cached);
    }

    pub fn rendered(&mut self, variant: &Variant, intent: WriteIntent) {
        self.push(variant, VariantStatus::Rendered);
        self.intents.push(intent);
    }

    pub fn degraded(&mut self, variant: &Variant, intent: WriteIntent, reason: String) {
        self.push(variant, VariantStatus::Degraded(reason));
        self.intents.push(intent);
    }

    /// Record the asset's failure, on `variant` when one was being produced.
    pub fn failed(&mut self, variant: Option<&Variant>, error: String) {
        if let Some(variant) = variant {
            self.push(variant, VariantStatus::Failed(error.clone()));
        }
        self.failure.get_or_insert(error);
    }

    pub fn skipped<'a>(&mut self, variants: impl IntoIterator<Item = &'a Variant>) {
        for variant in variants {
            self.push(variant, VariantStatus::Skipped);
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    /// Whether anything other than a cache hit happened.
    pub fn did_work(&self) -> bool {
        self.is_failure()
            || self
                .variants
                .iter()
                .any(|v| v.status != VariantStatus::Cached)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for variant in &self.variants {
            match variant.status {
                VariantStatus::Cached => stats.hit(),
                VariantStatus::Rendered | VariantStatus::Degraded(_) => stats.render(),
                VariantStatus::Failed(_) | VariantStatus::Skipped => stats.fail(),
            }
        }
        stats
    }
}

/// How one kind of base asset is brought up to date.
///
/// Implementations re-check every variant against the cache snapshot and
/// return write-intents for what they produced. They never mutate the cache.
pub trait RenderStrategy: Sync {
    fn render(&self, asset: &BaseAsset, cache: &CacheStore) -> RenderReport;
}

/// Counts for one build, returned to the CLI.
#[derive(Debug, Default)]
pub struct BuildSummary {
    pub images_scanned: usize,
    pub images_dirty: usize,
    /// Reports of every asset that was rendered or encoded.
    pub reports: Vec<RenderReport>,
    pub stats: CacheStats,
    /// Write-intents merged into the cache.
    pub merged: usize,
    /// Kinds skipped because their encoder is missing.
    pub skipped_kinds: Vec<MediaKind>,
}

impl BuildSummary {
    pub fn failures(&self) -> impl Iterator<Item = &RenderReport> {
        self.reports.iter().filter(|r| r.is_failure())
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    /// (succeeded, failed) asset counts for `kind`.
    pub fn kind_counts(&self, kind: MediaKind) -> (usize, usize) {
        self.reports
            .iter()
            .filter(|r| r.kind == kind)
            .fold((0, 0), |(ok, failed), r| {
                if r.is_failure() {
                    (ok, failed + 1)
                } else {
                    (ok + 1, failed)
                }
            })
    }

    fn absorb(&mut self, mut report: RenderReport, cache: &mut CacheStore) {
        self.stats += report.stats();
        self.merged += cache.merge(std::mem::take(&mut report.intents));
        self.reports.push(report);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Render one asset, turning a panic into a failed report.
fn render_guarded(strategy: &dyn RenderStrategy, asset: &BaseAsset, cache: &CacheStore) -> RenderReport {
    panic::catch_unwind(AssertUnwindSafe(|| strategy.render(asset, cache))).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(source = %asset.source().display(), error = %message, "render panicked");
        RenderReport::panicked(asset, &message)
    })
}

// =============================================================================
// Coordinator
// =============================================================================

/// Runs one build over a set of registries.
pub struct Pipeline<'a> {
    threads: usize,
    backend: &'a dyn ImageBackend,
    runner: &'a dyn CommandRunner,
    encoders: EncoderAvailability,
    encode_buffer: usize,
    cancel: CancelFlag,
    show_progress: bool,
    sinks: Option<SinkFactory<'a>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(threads: usize, backend: &'a dyn ImageBackend, runner: &'a dyn CommandRunner) -> Self {
        Self {
            threads: threads.max(1),
            backend,
            runner,
            encoders: EncoderAvailability::all(),
            encode_buffer: crate::config::ImageConfig::default().encode_buffer,
            cancel: CancelFlag::new(),
            show_progress: false,
            sinks: None,
        }
    }

    pub fn with_encoders(mut self, encoders: EncoderAvailability) -> Self {
        self.encoders = encoders;
        self
    }

    /// Initial bounded buffer size for image saves.
    pub fn with_encode_buffer(mut self, bytes: usize) -> Self {
        self.encode_buffer = bytes;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Draw a progress line on stderr for every phase.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Send progress to sinks made by `factory` instead of stderr.
    pub fn with_progress_sinks(mut self, factory: SinkFactory<'a>) -> Self {
        self.sinks = Some(factory);
        self
    }

    fn sink(&self, label: &str) -> Box<dyn ProgressSink> {
        if let Some(factory) = &self.sinks {
            factory(label)
        } else if self.show_progress {
            Box::new(TerminalSink::new(label))
        } else {
            Box::new(SilentSink)
        }
    }

    /// Bring every variant of every asset up to date.
    ///
    /// Write-intents are merged into `cache` as each phase completes, so on
    /// [`PipelineError::Interrupted`] the caller can still flush what
    /// finished.
    pub fn run(&self, registries: &Registries, cache: &mut CacheStore) -> Result<BuildSummary, PipelineError> {
        registries.check_destinations()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("recitale-worker-{i}"))
            .build()?;
        let mut summary = BuildSummary::default();

        let dirty = self.scan_phase(&pool, &registries.images, cache, &mut summary)?;
        let reports = self.render_phase(&pool, &dirty, cache)?;
        for report in reports {
            summary.absorb(report, cache);
        }
        self.check_cancelled(&summary)?;

        if !registries.videos.is_empty() {
            if self.encoders.video {
                self.encode_sequential(&VideoEncoder::new(self.runner), &registries.videos, cache, &mut summary)?;
            } else {
                warn!(assets = registries.videos.len(), "video encoder unavailable, skipping video files");
                summary.skipped_kinds.push(MediaKind::Video);
            }
        }
        if !registries.audios.is_empty() {
            if self.encoders.audio {
                self.encode_sequential(&AudioEncoder::new(self.runner), &registries.audios, cache, &mut summary)?;
            } else {
                warn!(assets = registries.audios.len(), "audio encoder unavailable, skipping audio files");
                summary.skipped_kinds.push(MediaKind::Audio);
            }
        }

        info!(
            scanned = summary.images_scanned,
            dirty = summary.images_dirty,
            merged = summary.merged,
            "build finished"
        );
        Ok(summary)
    }

    fn check_cancelled(&self, summary: &BuildSummary) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Interrupted {
                merged: summary.merged,
            });
        }
        Ok(())
    }

    /// Parallel probe of every image asset. Returns the dirty ones.
    fn scan_phase<'r>(
        &self,
        pool: &rayon::ThreadPool,
        images: &'r AssetRegistry,
        cache: &CacheStore,
        summary: &mut BuildSummary,
    ) -> Result<Vec<&'r BaseAsset>, PipelineError> {
        let assets = images.assets();
        let progress = ProgressAggregator::spawn("scan", assets.len(), self.sink("scan"))
            .map_err(PipelineError::Progress)?;
        let sender = progress.sender();

        let outcomes: Vec<(&BaseAsset, ScanOutcome)> = pool.install(|| {
            assets
                .par_iter()
                .filter_map(|asset| {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    let outcome = scan_asset(asset, self.backend, cache);
                    sender.advance();
                    Some((asset, outcome))
                })
                .collect()
        });
        progress.finish();

        summary.images_scanned = outcomes.len();
        let mut dirty = Vec::new();
        for (asset, outcome) in outcomes {
            match outcome {
                ScanOutcome::Dirty => dirty.push(asset),
                ScanOutcome::Cached => {
                    for _ in asset.variants() {
                        summary.stats.hit();
                    }
                }
            }
        }
        summary.images_dirty = dirty.len();
        self.check_cancelled(summary)?;
        Ok(dirty)
    }

    /// Parallel render of the dirty image assets against a cache snapshot.
    fn render_phase(
        &self,
        pool: &rayon::ThreadPool,
        dirty: &[&BaseAsset],
        cache: &CacheStore,
    ) -> Result<Vec<RenderReport>, PipelineError> {
        if dirty.is_empty() {
            return Ok(Vec::new());
        }
        let renderer = ImageRenderer::new(self.backend, self.encode_buffer);
        let progress = ProgressAggregator::spawn("render", dirty.len(), self.sink("render"))
            .map_err(PipelineError::Progress)?;
        let sender = progress.sender();

        let reports: Vec<RenderReport> = pool.install(|| {
            dirty
                .par_iter()
                .filter_map(|asset| {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    let report = render_guarded(&renderer, asset, cache);
                    sender.advance();
                    Some(report)
                })
                .collect()
        });
        progress.finish();
        Ok(reports)
    }

    /// Encode assets one at a time, merging after each.
    fn encode_sequential(
        &self,
        strategy: &dyn RenderStrategy,
        registry: &AssetRegistry,
        cache: &mut CacheStore,
        summary: &mut BuildSummary,
    ) -> Result<(), PipelineError> {
        let label = registry.kind().label();
        let progress = ProgressAggregator::spawn(label, registry.len(), self.sink(label))
            .map_err(PipelineError::Progress)?;
        let mut outcome = Ok(());
        for asset in registry {
            if let Err(e) = self.check_cancelled(summary) {
                outcome = Err(e);
                break;
            }
            let report = render_guarded(strategy, asset, cache);
            summary.absorb(report, cache);
            progress.sender().advance();
        }
        progress.finish();
        outcome
    }
}

struct SilentSink;

impl ProgressSink for SilentSink {
    fn update(&mut self, _done: usize, _total: usize) {}
    fn finish(&mut self, _done: usize, _total: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::tests::MockRunner;
    use crate::imaging::backend::tests::{MockBackend, MockFailure, RecordedOp};
    use crate::options::Options;
    use crate::progress::tests::RecordingSink;
    use crate::registry::TargetSize;
    use crate::test_helpers::TestSite;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn image_site(count: usize) -> (TestSite, Registries) {
        let site = TestSite::new();
        let mut registries = site.registries();
        for i in 0..count {
            let name = format!("img{i}.jpg");
            site.write_jpeg(&format!("g/{name}"), 8, 8);
            let asset = registries.images.get("g", &name);
            asset.thumbnail(TargetSize::height(100));
            asset.thumbnail(TargetSize::width(120));
        }
        (site, registries)
    }

    fn saves_of(backend: &MockBackend) -> usize {
        backend.saves().len()
    }

    // =========================================================================
    // Reports
    // =========================================================================

    #[test]
    fn report_stats_count_statuses() {
        let site = TestSite::new();
        let mut registries = site.registries();
        let asset = registries.images.get("g", "a.jpg");
        asset.thumbnail(TargetSize::height(1));
        asset.thumbnail(TargetSize::height(2));
        asset.thumbnail(TargetSize::height(3));
        let asset = asset.clone();
        let variants: Vec<&Variant> = asset.variants().collect();

        let mut report = RenderReport::new(&asset);
        report.cached(variants[0]);
        report.failed(Some(variants[1]), "boom".into());
        report.skipped([variants[2]]);
        let stats = report.stats();
        assert_eq!((stats.cached, stats.rendered, stats.failed), (1, 0, 2));
        assert!(report.is_failure());
        assert_eq!(report.failure.as_deref(), Some("boom"));
    }

    #[test]
    fn panicked_report_fails_every_variant() {
        let (_site, registries) = image_site(1);
        let asset = &registries.images.assets()[0];
        let report = RenderReport::panicked(asset, "oops");
        assert_eq!(report.variants.len(), 2);
        assert!(report.intents.is_empty());
        assert_eq!(report.stats().failed, 2);
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    // =========================================================================
    // Image phases
    // =========================================================================

    #[test]
    fn second_run_does_zero_render_work() {
        let (_site, registries) = image_site(4);
        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let mut cache = CacheStore::empty();
        let pipeline = Pipeline::new(2, &backend, &runner);

        let first = pipeline.run(&registries, &mut cache).unwrap();
        assert_eq!(first.images_dirty, 4);
        assert_eq!(first.stats.rendered, 8);
        assert_eq!(first.merged, 8);
        assert_eq!(saves_of(&backend), 8);

        let second = pipeline.run(&registries, &mut cache).unwrap();
        assert_eq!(second.images_dirty, 0);
        assert_eq!(second.stats.cached, 8);
        assert_eq!(second.stats.rendered, 0);
        assert_eq!(saves_of(&backend), 8);
        assert_eq!(backend.decode_count(), 4);
    }

    #[test]
    fn deleted_derived_file_regenerates_only_that_variant() {
        let (_site, registries) = image_site(2);
        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let mut cache = CacheStore::empty();
        let pipeline = Pipeline::new(2, &backend, &runner);
        pipeline.run(&registries, &mut cache).unwrap();

        let victim = registries.images.assets()[1].variants().next().unwrap().dest().to_path_buf();
        std::fs::remove_file(&victim).unwrap();

        let summary = pipeline.run(&registries, &mut cache).unwrap();
        assert_eq!(summary.images_dirty, 1);
        assert_eq!(summary.stats.rendered, 1);
        assert_eq!(summary.stats.cached, 3);
        assert!(victim.exists());
    }

    #[test]
    fn no_write_intent_is_lost_across_workers() {
        let (_site, registries) = image_site(24);
        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let mut cache = CacheStore::empty();
        let summary = Pipeline::new(8, &backend, &runner)
            .run(&registries, &mut cache)
            .unwrap();
        assert_eq!(summary.merged, 48);
        assert_eq!(cache.len(), 48);
        for asset in &registries.images {
            for variant in asset.variants() {
                assert!(cache.get(asset.source(), variant.dest()).is_some());
            }
        }
    }

    #[test]
    fn panicking_asset_does_not_cancel_siblings() {
        let (_site, registries) = image_site(3);
        let backend = MockBackend::new();
        let doomed = registries.images.assets()[0].variants().next().unwrap().dest().to_path_buf();
        backend.fail_save(&doomed, &[MockFailure::Panic]);
        let runner = MockRunner::new();
        let mut cache = CacheStore::empty();

        let summary = Pipeline::new(2, &backend, &runner)
            .run(&registries, &mut cache)
            .unwrap();
        assert_eq!(summary.failure_count(), 1);
        assert_eq!(summary.stats.rendered, 4);
        assert_eq!(cache.len(), 4);
        let failed = summary.failures().next().unwrap();
        assert!(failed.failure.as_deref().unwrap().contains("mock encoder panic"));
    }

    #[test]
    fn cancelled_build_returns_interrupted() {
        let (_site, registries) = image_site(2);
        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut cache = CacheStore::empty();
        let result = Pipeline::new(2, &backend, &runner)
            .with_cancel(cancel)
            .run(&registries, &mut cache);
        assert!(matches!(result, Err(PipelineError::Interrupted { merged: 0 })));
        assert!(backend.get_operations().is_empty());
    }

    #[test]
    fn dropped_session_flushes_merged_entries() {
        let (site, registries) = image_site(2);
        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let mut session = CacheSession::open(site.cache_file()).unwrap();
        Pipeline::new(2, &backend, &runner)
            .run(&registries, session.store_mut())
            .unwrap();
        drop(session);

        let reloaded = CacheStore::load(&site.cache_file()).unwrap();
        assert_eq!(reloaded.len(), 4);
    }

    // =========================================================================
    // Encoders
    // =========================================================================

    #[test]
    fn missing_encoder_skips_kind_with_summary_entry() {
        let site = TestSite::new();
        let mut registries = site.registries();
        site.write("g/clip.mp4", b"video");
        registries.videos.get("g", "clip.mp4").thumbnail(TargetSize::height(900));

        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let mut cache = CacheStore::empty();
        let summary = Pipeline::new(1, &backend, &runner)
            .with_encoders(EncoderAvailability {
                video: false,
                audio: true,
            })
            .run(&registries, &mut cache)
            .unwrap();
        assert_eq!(summary.skipped_kinds, vec![MediaKind::Video]);
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn video_and_audio_are_encoded_and_recorded() {
        let site = TestSite::new();
        let mut registries = site.registries();
        site.write("g/clip.mp4", b"video");
        site.write("g/song.flac", b"audio");
        let clip = registries.videos.get("g", "clip.mp4");
        clip.thumbnail(TargetSize::height(900));
        clip.reencode(TargetSize::new(Some(1280), Some(720)));
        registries.audios.get("g", "song.flac").reencode(TargetSize::default());

        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let mut cache = CacheStore::empty();
        let pipeline = Pipeline::new(1, &backend, &runner);
        let summary = pipeline.run(&registries, &mut cache).unwrap();
        assert_eq!(summary.kind_counts(MediaKind::Video), (1, 0));
        assert_eq!(summary.kind_counts(MediaKind::Audio), (1, 0));
        assert_eq!(summary.merged, 3);
        assert_eq!(runner.commands().len(), 3);

        let again = pipeline.run(&registries, &mut cache).unwrap();
        assert_eq!(again.stats.cached, 3);
        assert_eq!(runner.commands().len(), 3);
        assert!(!backend
            .get_operations()
            .iter()
            .any(|op| matches!(op, RecordedOp::Decode(_))));
    }

    #[test]
    fn sequential_encoders_report_progress() {
        let site = TestSite::new();
        let mut registries = site.registries();
        for name in ["a.mp4", "b.mp4"] {
            site.write(&format!("g/{name}"), b"video");
            registries.videos.get("g", name).thumbnail(TargetSize::height(900));
        }
        site.write("g/song.flac", b"audio");
        registries.audios.get("g", "song.flac").reencode(TargetSize::default());

        let sinks: Arc<Mutex<HashMap<String, RecordingSink>>> = Arc::default();
        let factory_sinks = Arc::clone(&sinks);
        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let mut cache = CacheStore::empty();
        Pipeline::new(1, &backend, &runner)
            .with_progress_sinks(Box::new(move |label: &str| -> Box<dyn ProgressSink> {
                let sink = RecordingSink::default();
                factory_sinks.lock().unwrap().insert(label.to_string(), sink.clone());
                Box::new(sink)
            }))
            .run(&registries, &mut cache)
            .unwrap();

        let sinks = sinks.lock().unwrap();
        assert_eq!(*sinks["video"].finished.lock().unwrap(), Some((2, 2)));
        assert_eq!(*sinks["video"].updates.lock().unwrap(), vec![(1, 2), (2, 2)]);
        assert_eq!(*sinks["audio"].finished.lock().unwrap(), Some((1, 1)));
    }

    // =========================================================================
    // Destinations
    // =========================================================================

    #[test]
    fn shared_destination_is_rejected_before_any_work() {
        let site = TestSite::new();
        let mut registries = site.registries();
        for name in ["a.tif", "a-tif.jpg"] {
            site.write_jpeg(&format!("g/{name}"), 8, 8);
            registries.images.get("g", name).thumbnail(TargetSize::height(24));
        }
        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let mut cache = CacheStore::empty();

        let result = Pipeline::new(2, &backend, &runner).run(&registries, &mut cache);
        assert!(matches!(result, Err(PipelineError::DuplicateDestination(_))));
        assert!(backend.get_operations().is_empty());
    }

    #[test]
    fn same_stem_and_overrides_write_distinct_files() {
        let site = TestSite::new();
        let mut registries = site.registries();
        site.write_jpeg("g/a.jpg", 8, 8);
        site.write_jpeg("g/a.tif", 8, 8);
        registries.images.get("g", "a.jpg").thumbnail(TargetSize::height(24));
        registries.images.get("g", "a.tif").thumbnail(TargetSize::height(24));
        registries
            .images
            .get_with("g", "a.jpg", &Options::new().with("quality", 40))
            .thumbnail(TargetSize::height(24));
        let backend = MockBackend::new();
        let runner = MockRunner::new();
        let mut cache = CacheStore::empty();

        let summary = Pipeline::new(2, &backend, &runner).run(&registries, &mut cache).unwrap();
        assert_eq!(summary.stats.rendered, 3);
        let mut outputs: Vec<String> = backend
            .saves()
            .into_iter()
            .filter_map(|op| match op {
                RecordedOp::Save { output, .. } => Some(output),
                _ => None,
            })
            .collect();
        outputs.sort();
        outputs.dedup();
        assert_eq!(outputs.len(), 3);
        assert_eq!(cache.len(), 3);
    }

    // =========================================================================
    // Session close
    // =========================================================================

    /// A session whose flush fails: its parent directory is a regular file.
    fn unflushable_session(site: &TestSite) -> CacheSession {
        site.write("blocker", b"file");
        CacheSession::fresh(site.path("blocker/cache.json"))
    }

    #[test]
    fn close_session_keeps_run_error_over_flush_error() {
        let site = TestSite::new();
        let session = unflushable_session(&site);
        let outcome: Result<(), _> = Err(PipelineError::Interrupted { merged: 3 });
        let result = close_session(session, outcome);
        assert!(matches!(result, Err(PipelineError::Interrupted { merged: 3 })));
    }

    #[test]
    fn close_session_reports_flush_error_after_good_run() {
        let site = TestSite::new();
        let session = unflushable_session(&site);
        let result = close_session(session, Ok(7));
        assert!(matches!(result, Err(PipelineError::Cache(_))));
    }

    #[test]
    fn close_session_passes_outcome_through() {
        let site = TestSite::new();
        let session = CacheSession::fresh(site.cache_file());
        assert_eq!(close_session(session, Ok(7)).unwrap(), 7);
        assert!(site.cache_file().exists());
    }
}
