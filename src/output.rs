//! CLI output formatting.
//!
//! Every function here is pure: it takes pipeline results and returns lines.
//! The `print_*` wrappers write them to stdout. Progress lines go to stderr
//! through [`progress`](crate::progress).
//!
//! # Output Format
//!
//! ## Build
//!
//! ```text
//! Discovered 12 files in 3 galleries (9 images, 2 videos, 1 audio)
//! landscapes/dawn.jpg
//!     thumbnail x900: rendered
//!     thumbnail 1200x: cached
//! landscapes/timelapse.mp4
//!     reencode 1280x720: failed (ffmpeg failed (exit status: 1): ...)
//!     thumbnail x900: skipped
//!
//! Images: 9 scanned, 1 dirty
//! Video: 0 encoded, 1 failed
//! Cache: 10 cached, 1 rendered, 2 failed (13 total)
//! ```
//!
//! Assets whose variants were all cached are not listed.
//!
//! ## Check
//!
//! ```text
//! image landscapes/dawn.jpg
//!     thumbnail x900: fresh
//!     thumbnail 1200x: stale
//! ```

use crate::discover::DiscoverSummary;
use crate::pipeline::{BuildSummary, RenderReport, VariantState, VariantStatus};
use crate::registry::{BaseAsset, MediaKind};
use std::path::Path;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// `label [done/total] pct%`, with the count right-aligned to the total.
pub fn format_progress_line(label: &str, done: usize, total: usize) -> String {
    let width = total.to_string().len();
    let percent = if total == 0 { 100 } else { done * 100 / total };
    format!("{label} [{done:>width$}/{total}] {percent:>3}%")
}

/// Show `path` relative to `root` when possible.
fn display_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn status_text(status: &VariantStatus) -> String {
    match status {
        VariantStatus::Cached => "cached".to_string(),
        VariantStatus::Rendered => "rendered".to_string(),
        VariantStatus::Degraded(reason) => format!("rendered ({reason})"),
        VariantStatus::Failed(error) => format!("failed ({error})"),
        VariantStatus::Skipped => "skipped".to_string(),
    }
}

/// Lines for one asset report. Empty when nothing but cache hits happened.
pub fn format_render_report(report: &RenderReport, content_root: &Path) -> Vec<String> {
    if !report.did_work() {
        return Vec::new();
    }
    let mut lines = vec![display_path(&report.source, content_root)];
    for variant in &report.variants {
        lines.push(format!(
            "{}{}: {}",
            indent(1),
            variant.name,
            status_text(&variant.status)
        ));
    }
    if report.variants.is_empty()
        && let Some(failure) = &report.failure
    {
        lines.push(format!("{}failed ({failure})", indent(1)));
    }
    lines
}

fn plural(n: usize, one: &str, many: &str) -> String {
    if n == 1 {
        format!("{n} {one}")
    } else {
        format!("{n} {many}")
    }
}

pub fn format_discover_summary(summary: &DiscoverSummary) -> String {
    format!(
        "Discovered {} in {} ({}, {}, {})",
        plural(summary.total(), "file", "files"),
        plural(summary.galleries, "gallery", "galleries"),
        plural(summary.images, "image", "images"),
        plural(summary.videos, "video", "videos"),
        plural(summary.audios, "audio", "audio"),
    )
}

/// Closing summary of a build.
pub fn format_build_summary(summary: &BuildSummary) -> Vec<String> {
    let mut lines = vec![format!(
        "Images: {} scanned, {} dirty",
        summary.images_scanned, summary.images_dirty
    )];
    for (kind, label) in [(MediaKind::Video, "Video"), (MediaKind::Audio, "Audio")] {
        if summary.skipped_kinds.contains(&kind) {
            lines.push(format!("{label}: skipped (encoder not found)"));
            continue;
        }
        let (ok, failed) = summary.kind_counts(kind);
        if ok + failed > 0 {
            lines.push(format!("{label}: {ok} encoded, {failed} failed"));
        }
    }
    lines.push(format!("Cache: {}", summary.stats));
    lines
}

/// Lines for `check`: one header per asset, one line per variant.
pub fn format_check_asset(asset: &BaseAsset, states: &[VariantState]) -> Vec<String> {
    let mut lines = vec![format!(
        "{} {}",
        asset.kind(),
        asset.relative_path().display()
    )];
    for state in states {
        let word = if state.fresh { "fresh" } else { "stale" };
        lines.push(format!("{}{}: {word}", indent(1), state.name));
    }
    lines
}

pub fn print_build_output(summary: &BuildSummary, content_root: &Path) {
    for report in &summary.reports {
        for line in format_render_report(report, content_root) {
            println!("{line}");
        }
    }
    if summary.reports.iter().any(RenderReport::did_work) {
        println!();
    }
    for line in format_build_summary(summary) {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStats;
    use crate::pipeline::VariantReport;
    use std::path::PathBuf;

    fn report(kind: MediaKind, statuses: &[(&str, VariantStatus)]) -> RenderReport {
        RenderReport {
            kind,
            source: PathBuf::from("/site/g/a.jpg"),
            variants: statuses
                .iter()
                .map(|(name, status)| VariantReport {
                    name: name.to_string(),
                    dest: PathBuf::from("/site/out/g/a.jpg"),
                    status: status.clone(),
                })
                .collect(),
            intents: Vec::new(),
            failure: statuses.iter().find_map(|(_, s)| match s {
                VariantStatus::Failed(e) => Some(e.clone()),
                _ => None,
            }),
        }
    }

    // =========================================================================
    // Progress
    // =========================================================================

    #[test]
    fn progress_line_pads_to_total() {
        assert_eq!(format_progress_line("scan", 3, 120), "scan [  3/120]   2%");
        assert_eq!(format_progress_line("render", 4, 4), "render [4/4] 100%");
    }

    #[test]
    fn progress_line_empty_phase() {
        assert_eq!(format_progress_line("scan", 0, 0), "scan [0/0] 100%");
    }

    // =========================================================================
    // Reports
    // =========================================================================

    #[test]
    fn cached_only_report_is_silent() {
        let r = report(MediaKind::Image, &[("thumbnail x900", VariantStatus::Cached)]);
        assert!(format_render_report(&r, Path::new("/site")).is_empty());
    }

    #[test]
    fn report_lists_every_variant() {
        let r = report(
            MediaKind::Image,
            &[
                ("thumbnail x900", VariantStatus::Rendered),
                ("thumbnail 1200x", VariantStatus::Cached),
                ("thumbnail x300", VariantStatus::Degraded("metadata stripped".into())),
            ],
        );
        assert_eq!(
            format_render_report(&r, Path::new("/site")),
            vec![
                "g/a.jpg",
                "    thumbnail x900: rendered",
                "    thumbnail 1200x: cached",
                "    thumbnail x300: rendered (metadata stripped)",
            ]
        );
    }

    #[test]
    fn failure_without_variants_is_shown() {
        let mut r = report(MediaKind::Image, &[]);
        r.failure = Some("cannot decode".into());
        assert_eq!(
            format_render_report(&r, Path::new("/elsewhere")),
            vec!["/site/g/a.jpg", "    failed (cannot decode)"]
        );
    }

    // =========================================================================
    // Summaries
    // =========================================================================

    #[test]
    fn discover_summary_pluralizes() {
        let summary = DiscoverSummary {
            galleries: 1,
            images: 2,
            videos: 1,
            audios: 0,
            ignored: 4,
        };
        assert_eq!(
            format_discover_summary(&summary),
            "Discovered 3 files in 1 gallery (2 images, 1 video, 0 audio)"
        );
    }

    #[test]
    fn build_summary_lines() {
        let summary = BuildSummary {
            images_scanned: 9,
            images_dirty: 1,
            reports: vec![report(
                MediaKind::Video,
                &[("reencode 1280x720", VariantStatus::Failed("boom".into()))],
            )],
            stats: CacheStats {
                cached: 10,
                rendered: 1,
                failed: 2,
            },
            merged: 1,
            skipped_kinds: vec![MediaKind::Audio],
        };
        assert_eq!(
            format_build_summary(&summary),
            vec![
                "Images: 9 scanned, 1 dirty",
                "Video: 0 encoded, 1 failed",
                "Audio: skipped (encoder not found)",
                "Cache: 10 cached, 1 rendered, 2 failed (13 total)",
            ]
        );
    }

    #[test]
    fn check_lines() {
        let site = crate::test_helpers::TestSite::new();
        let mut registries = site.registries();
        let asset = registries.images.get("g", "a.jpg").clone();
        let states = vec![
            VariantState {
                name: "thumbnail x900".into(),
                dest: PathBuf::from("x"),
                fresh: true,
            },
            VariantState {
                name: "thumbnail 1200x".into(),
                dest: PathBuf::from("y"),
                fresh: false,
            },
        ];
        assert_eq!(
            format_check_asset(&asset, &states),
            vec![
                "image g/a.jpg",
                "    thumbnail x900: fresh",
                "    thumbnail 1200x: stale",
            ]
        );
    }
}
