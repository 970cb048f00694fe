//! 📊 progress.rs: "Are we there yet?", every bulk write, every time, forever.
//!
//! 🚀 A progress bar per bulk write (documents landed out of documents in the batch),
//! and a summary table at the end of the run so the cron log says something useful.
//!
//! ⚠️  Warning: Watching this progress bar will not make it go faster.
//! Neither will refreshing it. We've tried. Science says no.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

use crate::bulk::BulkWriteReport;
use crate::metrics::FamilyKind;

/// 🔢 Formats a number with commas for the 3 people in the audience who like readability.
/// "1000000 docs" → "1,000,000 docs": you're welcome, eyes.
pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ Formats a Duration into MM:SS or HH:MM:SS.
/// If it shows HH:MM:SS, the bulk timeout already killed us. Ten minutes, remember?
pub(crate) fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// 📊 Shared between every worker writing one batch. `&self` all the way; atomics inside.
pub(crate) struct WriteProgress {
    index: String,
    total_docs: u64,
    written_docs: AtomicU64,
    failed_docs: AtomicU64,
    progress_bar: ProgressBar,
    start_time: Instant,
}

impl std::fmt::Debug for WriteProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 custom Debug impl because ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("WriteProgress")
            .field("index", &self.index)
            .field("total_docs", &self.total_docs)
            .field("written_docs", &self.written_docs)
            .finish()
    }
}

impl WriteProgress {
    /// 🚀 `visible = false` gives a hidden bar that still counts. CI logs stay clean.
    pub(crate) fn new(index: &str, total_docs: u64, visible: bool) -> Self {
        let progress_bar = if visible {
            ProgressBar::new(total_docs)
        } else {
            ProgressBar::hidden()
        };
        // -- 🎨 cyan because it's classy, blue because it's calm
        if let Ok(style) = ProgressStyle::default_bar().template("{msg}\n| [{bar:40.cyan/blue}]") {
            progress_bar.set_style(style.progress_chars("=>-"));
        }

        Self {
            index: index.to_string(),
            total_docs,
            written_docs: AtomicU64::new(0),
            failed_docs: AtomicU64::new(0),
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// 🔄 One sub-batch finished. Count it, move the bar, redraw the little table.
    pub(crate) fn record(&self, written: u64, failed: u64) {
        let written_so_far = self.written_docs.fetch_add(written, Ordering::Relaxed) + written;
        let failed_so_far = self.failed_docs.fetch_add(failed, Ordering::Relaxed) + failed;
        let done = written_so_far + failed_so_far;
        self.progress_bar.set_position(done);
        self.render(written_so_far, failed_so_far, done);
    }

    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    fn render(&self, written: u64, failed: u64, done: u64) {
        let elapsed = self.start_time.elapsed();
        let docs_per_sec = if elapsed.as_secs_f64() > 0.0 {
            (done as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };
        let percent = if self.total_docs > 0 {
            (done as f64 / self.total_docs as f64) * 100.0
        } else {
            0.0
        };

        // 🍽️ two columns, right-aligned, no borders, minimalists, and the borders looked bad
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Docs/s", format_number(docs_per_sec)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!(
                "{} / {} Docs",
                format_number(written),
                format_number(self.total_docs)
            ))
            .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} failed", format_number(failed)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}%", percent)).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed)))
                .set_alignment(CellAlignment::Right),
            Cell::new(""),
        ]);

        self.progress_bar
            .set_message(format!("index: {}\n{}", self.index, table));
    }
}

/// 🧾 One family's worth of run, for the summary table.
#[derive(Debug, Clone)]
pub struct FamilyRunReport {
    pub family: FamilyKind,
    pub repositories: usize,
    pub write: BulkWriteReport,
}

/// 🍽️ The end-of-run table. One row per family. Printed by the CLI, asserted on by tests.
pub fn summary_table(reports: &[FamilyRunReport]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "family", "index", "repos", "documents", "requests", "written", "failed", "elapsed",
    ]);
    for report in reports {
        let write = &report.write;
        table.add_row(vec![
            Cell::new(report.family.name()),
            Cell::new(&write.index),
            Cell::new(format_number(report.repositories as u64)).set_alignment(CellAlignment::Right),
            Cell::new(format_number(write.documents as u64)).set_alignment(CellAlignment::Right),
            Cell::new(format_number(write.requests as u64)).set_alignment(CellAlignment::Right),
            Cell::new(format_number(write.succeeded as u64)).set_alignment(CellAlignment::Right),
            Cell::new(format_number(write.failed as u64)).set_alignment(CellAlignment::Right),
            Cell::new(format_duration(write.elapsed)).set_alignment(CellAlignment::Right),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn the_one_where_durations_only_show_hours_when_they_must() {
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn the_one_where_hidden_progress_still_counts() {
        let the_progress = WriteProgress::new("idx", 10, false);
        the_progress.record(4, 1);
        the_progress.record(5, 0);
        assert_eq!(the_progress.written_docs.load(Ordering::Relaxed), 9);
        assert_eq!(the_progress.failed_docs.load(Ordering::Relaxed), 1);
        the_progress.finish();
    }

    #[test]
    fn the_one_where_the_summary_has_a_row_per_family() {
        let the_reports = vec![FamilyRunReport {
            family: FamilyKind::GeneralMetrics,
            repositories: 2,
            write: BulkWriteReport {
                index: "opensearch_general_metrics".into(),
                documents: 26,
                partitions: 1,
                requests: 1,
                succeeded: 25,
                failed: 1,
                failed_requests: 0,
                elapsed: Duration::from_secs(2),
            },
        }];
        let rendered = summary_table(&the_reports).to_string();
        assert!(rendered.contains("general-metrics"));
        assert!(rendered.contains("opensearch_general_metrics"));
        assert!(rendered.contains("00:02"));
    }
}
