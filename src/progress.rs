//! Progress reporting for a reconciliation run
//!
//! Provides real-time progress display using indicatif progress bars.

use crate::catalog::{CatalogStats, Watermarks};
use crate::coordinator::{PhaseSummary, RunStatus, RunSummary};
use crate::pipeline::PipelineCounters;
use crate::types::ProductClass;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Progress reporter that displays pipeline counters
pub struct ProgressReporter {
    /// Progress bar
    bar: ProgressBar,

    /// Stop signal for the refresh thread
    stop: Arc<AtomicBool>,

    refresher: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            bar,
            stop: Arc::new(AtomicBool::new(false)),
            refresher: None,
        }
    }

    /// Redraw from `counters` until finished
    pub fn watch(&mut self, counters: Arc<PipelineCounters>) {
        let bar = self.bar.clone();
        let stop = Arc::clone(&self.stop);
        self.refresher = Some(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                bar.set_message(counters_message(&counters));
                thread::sleep(Duration::from_millis(250));
            }
        }));
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&mut self, message: &str) {
        self.stop_refresher();
        self.bar.finish_with_message(message.to_string());
    }

    fn stop_refresher(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.refresher.take() {
            let _ = handle.join();
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_refresher();
    }
}

fn counters_message(counters: &PipelineCounters) -> String {
    let (fetched, committed, failed, bytes) = counters.snapshot();
    format!(
        "Fetched: {} | Committed: {} | Failed: {} | Size: {}",
        format_number(fetched),
        format_number(committed),
        format_number(failed),
        format_size(bytes, BINARY),
    )
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|&b| b as char)
                .collect::<String>()
        })
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

fn format_mark(mark: Option<chrono::NaiveDateTime>) -> String {
    mark.map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Print a header at the start of the run
pub fn print_header(source: &str, workers: usize, catalog: &str, store: &str) {
    println!();
    println!(
        "{} {}",
        style("imerg-sync").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Source:").bold(), source);
    println!("  {} {}", style("Workers:").bold(), workers);
    println!("  {} {}", style("Catalog:").bold(), catalog);
    println!("  {} {}", style("Store:").bold(), store);
    println!();
}

fn print_phase(class: ProductClass, phase: &PhaseSummary) {
    println!("  {}", style(format!("{} phase", class)).bold());
    println!(
        "    listed {} in {} partitions, {} candidates",
        format_number(phase.listed),
        format_number(phase.partitions),
        format_number(phase.candidates)
    );
    println!(
        "    fetched {}, committed {} ({}), superseded {}",
        format_number(phase.fetched),
        format_number(phase.committed),
        format_size(phase.bytes, BINARY),
        format_number(phase.superseded)
    );
    let skipped = &phase.skipped;
    if skipped.total() > 0 {
        println!(
            "    skipped {} (not newer {}, expired {}, malformed {}, duplicate {})",
            format_number(skipped.total()),
            skipped.not_newer,
            skipped.expired,
            skipped.malformed,
            skipped.duplicate
        );
    }
    if phase.failed > 0 || phase.deferred > 0 {
        println!(
            "    {} {} failed, {} deferred",
            style("!").yellow().bold(),
            format_number(phase.failed),
            format_number(phase.deferred)
        );
        for (name, reason) in phase.failures.iter().take(5) {
            println!("      {}: {}", name, style(reason).dim());
        }
    }
    if let Some(reason) = &phase.aborted {
        println!("    {} listing aborted: {}", style("!").yellow().bold(), reason);
    }
}

/// Print a summary of the run
pub fn print_summary(summary: &RunSummary, catalog: &str) {
    let title = match summary.status {
        RunStatus::Completed => style("Sync Complete").green().bold(),
        RunStatus::Partial => style("Sync Completed With Failures").yellow().bold(),
        RunStatus::Failed => style("Sync Failed").red().bold(),
        RunStatus::Interrupted => style("Sync Interrupted").yellow().bold(),
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    for class in ProductClass::ALL {
        if let Some(phase) = summary.phase(class) {
            print_phase(class, phase);
        }
    }
    if let Some(maintenance) = &summary.maintenance {
        println!(
            "  {} {} entries, {} files",
            style("Purged:").bold(),
            format_number(maintenance.purged_entries),
            format_number(maintenance.purged_files)
        );
    }
    if let Some(refresh) = &summary.refresh {
        println!("  {} {}", style("Service:").bold(), refresh);
    }
    println!(
        "  {} {} -> {}",
        style("Late:").bold(),
        format_mark(summary.before.late),
        format_mark(summary.after.late)
    );
    println!(
        "  {} {} -> {}",
        style("Early:").bold(),
        format_mark(summary.before.early),
        format_mark(summary.after.early)
    );
    println!(
        "  {} {:.1}s",
        style("Duration:").bold(),
        summary.duration.as_secs_f64()
    );
    if let Some(error) = &summary.error {
        println!("  {} {}", style("Error:").red().bold(), error);
    }
    println!("  {} {}", style("Catalog:").bold(), catalog);
    println!();
}

/// Print catalog state for the `status` subcommand
pub fn print_status(
    catalog: &str,
    marks: &Watermarks,
    stats: &CatalogStats,
    last_run: &[(&str, Option<String>)],
) {
    println!();
    println!("{} {}", style("Catalog").cyan().bold(), catalog);
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Late watermark:").bold(), format_mark(marks.late));
    println!("  {} {}", style("Early watermark:").bold(), format_mark(marks.early));
    println!(
        "  {} {} ({} late, {} early)",
        style("Rasters:").bold(),
        format_number(stats.total()),
        format_number(stats.late),
        format_number(stats.early)
    );
    println!(
        "  {} {} .. {}",
        style("Range:").bold(),
        format_mark(stats.oldest),
        format_mark(stats.newest)
    );
    for (key, value) in last_run {
        println!(
            "  {} {}",
            style(format!("{}:", key)).bold(),
            value.as_deref().unwrap_or("-")
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }

    #[test]
    fn test_format_mark() {
        assert_eq!(format_mark(None), "none");
        let ts = NaiveDate::from_ymd_opt(2018, 8, 9)
            .unwrap()
            .and_hms_opt(23, 30, 0)
            .unwrap();
        assert_eq!(format_mark(Some(ts)), "2018-08-09 23:30");
    }

    #[test]
    fn test_counters_message() {
        let counters = PipelineCounters::default();
        counters.committed.store(1234, Ordering::Relaxed);
        counters.bytes.store(2048, Ordering::Relaxed);
        let msg = counters_message(&counters);
        assert!(msg.contains("Committed: 1,234"));
        assert!(msg.contains("2 KiB"));
    }
}
