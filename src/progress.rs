//! Terminal progress for the CLI
//!
//! A spinner shows the live counters of a running job; a styled summary is
//! printed when it ends.

use crate::config::JobRequest;
use crate::status::{JobState, JobStatus};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner showing a job's live status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        let spinner = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(spinner);
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the display from a status snapshot
    pub fn update(&self, status: &JobStatus) {
        let c = &status.counters;
        let rate = if status.took > 0 {
            c.processed() as f64 * 1000.0 / status.took as f64
        } else {
            0.0
        };

        let mut msg = format!(
            "Processed: {}/{} | Created: {} | Updated: {} | Conflicts: {} | Rate: {:.0}/s",
            format_number(c.processed()),
            format_number(c.total),
            format_number(c.created),
            format_number(c.updated),
            format_number(c.version_conflicts),
            rate,
        );
        if status.throttled_until_millis > 0 {
            msg.push_str(&format!(" | Throttled: {}ms", status.throttled_until_millis));
        }

        self.bar.set_message(msg);
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print the final status of a job
pub fn print_summary(status: &JobStatus) {
    let c = &status.counters;
    let secs = status.took as f64 / 1000.0;
    let rate = if secs > 0.0 { c.processed() as f64 / secs } else { 0.0 };

    let title = match status.state {
        JobState::Completed => style("Reindex Complete").green().bold(),
        JobState::Cancelled => style("Reindex Cancelled").yellow().bold(),
        JobState::Failed => style("Reindex Failed").red().bold(),
        JobState::Running => style("Reindex Running").cyan().bold(),
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    if let Some(task_id) = &status.task_id {
        println!("  {} {}", style("Task:").bold(), task_id);
    }
    println!("  {} {}", style("Total:").bold(), format_number(c.total));
    println!("  {} {}", style("Created:").bold(), format_number(c.created));
    println!("  {} {}", style("Updated:").bold(), format_number(c.updated));
    if c.deleted > 0 {
        println!("  {} {}", style("Deleted:").bold(), format_number(c.deleted));
    }
    if c.noops > 0 {
        println!("  {} {}", style("Noops:").bold(), format_number(c.noops));
    }
    println!("  {} {}", style("Batches:").bold(), format_number(c.batches));
    println!(
        "  {} {:.1}s ({:.0} docs/sec)",
        style("Duration:").bold(),
        secs,
        rate
    );
    if c.throttled_millis > 0 {
        println!(
            "  {} {:.1}s",
            style("Throttled:").bold(),
            c.throttled_millis as f64 / 1000.0
        );
    }
    if c.retries > 0 {
        println!("  {} {}", style("Retries:").bold(), format_number(c.retries));
    }
    if c.version_conflicts > 0 {
        println!(
            "  {} {}",
            style("Conflicts:").yellow().bold(),
            format_number(c.version_conflicts)
        );
    }
    if status.failure_count > 0 {
        println!(
            "  {} {}",
            style("Failures:").yellow().bold(),
            format_number(status.failure_count)
        );
        for failure in status.failures.iter().take(5) {
            println!(
                "    {} [{}] {}",
                failure.id.as_deref().unwrap_or("-"),
                failure.status,
                failure.cause
            );
        }
    }
    if let Some(reason) = &status.reason {
        println!("  {} {}", style("Reason:").red().bold(), reason);
    }
    println!();
}

/// Print a header at the start of a job
pub fn print_header(request: &JobRequest, task_id: &str) {
    println!();
    println!(
        "{} {}",
        style("bulk-reindex").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Job:").bold(), request.describe());
    println!("  {} {}", style("Task:").bold(), task_id);
    println!("  {} {}", style("Slices:").bold(), request.slices());
    println!(
        "  {} {}",
        style("Rate:").bold(),
        request.requests_per_second()
    );
    println!();
}
