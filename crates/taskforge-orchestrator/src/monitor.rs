//! Progress aggregation and human-readable status reports.

use crate::process::Process;
use crate::types::{Status, TaskResult};
use chrono::Local;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;
use tracing::{info, Level};

const RULE: &str = "********************************************************************";

/// Render `value` on one line, cut to `len` characters with a `...` suffix.
pub fn truncate_fmt(value: impl Display, len: usize) -> String {
    let text: String = value.to_string().chars().filter(|c| *c != '\n').collect();
    if text.chars().count() > len {
        let head: String = text.chars().take(len).collect();
        format!("{head}...")
    } else {
        text
    }
}

/// Mean contribution of all processes: terminal ones count 1, pending ones
/// their own progress, the rest 0. An empty population is complete.
pub fn overall_progress(processes: &BTreeMap<String, Process>) -> f64 {
    if processes.is_empty() {
        return 1.0;
    }
    let total: f64 = processes.values().map(Process::progress_contribution).sum();
    (total / processes.len() as f64).clamp(0.0, 1.0)
}

/// Number of processes in each state; every state is present.
pub fn status_counts(processes: &BTreeMap<String, Process>) -> BTreeMap<Status, usize> {
    let mut counts: BTreeMap<Status, usize> = Status::ALL.iter().map(|s| (*s, 0)).collect();
    for process in processes.values() {
        *counts.entry(process.status()).or_default() += 1;
    }
    counts
}

pub fn format_pending(process: &Process) -> String {
    let since = process
        .start_time()
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".to_string());
    let mut text = format!(
        "  [{}] pending since {since} [Attempt: {}]",
        process.id(),
        process.attempts()
    );
    if let Some(update) = process.progress_update() {
        text.push_str(&format!(
            " {:.0}% (last update: {})",
            process.progress() * 100.0,
            update.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        ));
    }
    text
}

fn format_elapsed(elapsed: Option<Duration>) -> String {
    elapsed.map_or_else(|| "-".to_string(), |d| format!("{d:.3?}"))
}

/// One line per process.
pub fn full_status_lines(processes: &BTreeMap<String, Process>) -> Vec<String> {
    processes
        .values()
        .map(|p| match (p.status(), p.result()) {
            (Status::New, _) => format!("  [{}] new", p.id()),
            (Status::Pending, _) => format_pending(p),
            (Status::Retry, _) => format!("  [{}] retry after attempt {}", p.id(), p.attempts()),
            (Status::Done, Some(TaskResult::Value(value))) => format!(
                "  [{}] done in {} ({})",
                p.id(),
                format_elapsed(p.elapsed_time()),
                truncate_fmt(value, 30)
            ),
            (Status::Failed, Some(TaskResult::Failure(failure))) => format!(
                "  [{}] failed in {} ({})",
                p.id(),
                format_elapsed(p.elapsed_time()),
                truncate_fmt(&failure.error, 30)
            ),
            (status, _) => format!("  [{}] {}", p.id(), status.name().to_lowercase()),
        })
        .collect()
}

/// Pending processes, then a count per state and the overall progress.
pub fn summary_lines(processes: &BTreeMap<String, Process>) -> Vec<String> {
    let mut lines: Vec<String> = processes
        .values()
        .filter(|p| p.status() == Status::Pending)
        .map(format_pending)
        .collect();
    for (status, count) in status_counts(processes) {
        lines.push(format!("  {}: {count}", status.name()));
    }
    lines.push(format!(
        "  progress: {:.0}%",
        overall_progress(processes) * 100.0
    ));
    lines
}

fn emit(title: &str, lines: Vec<String>) {
    info!("************** {title} {} ***************", Local::now().format("%Y-%m-%d %H:%M:%S"));
    for line in lines {
        info!("{line}");
    }
    info!("{RULE}");
}

/// Log every process, if `verbosity` admits INFO.
pub fn log_full_status(processes: &BTreeMap<String, Process>, verbosity: Level) {
    if verbosity < Level::INFO {
        return;
    }
    emit("Full Status", full_status_lines(processes));
}

/// Log the summary report, if `verbosity` admits INFO.
pub fn log_status(processes: &BTreeMap<String, Process>, verbosity: Level) {
    if verbosity < Level::INFO {
        return;
    }
    emit("Status", summary_lines(processes));
}

/// Which reports a reconciliation cycle should emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportsDue {
    pub full: bool,
    pub summary: bool,
}

/// Decides when the loop prints reports.
///
/// A full report goes out every `full_every` cycles, starting with the first.
/// A state change arms a summary countdown of `cooldown` cycles, shortened by
/// however long it has been since the last summary, so summaries never come
/// closer than `cooldown` cycles apart and a quiet run prints none.
#[derive(Debug, Clone)]
pub struct ReportSchedule {
    full_every: u64,
    cooldown: i64,
    iteration: u64,
    countdown: i64,
}

impl ReportSchedule {
    pub fn new(full_every: u64, cooldown: u64) -> Self {
        Self {
            full_every,
            cooldown: i64::try_from(cooldown).unwrap_or(i64::MAX),
            iteration: 0,
            countdown: -1,
        }
    }

    /// Advance one cycle.
    pub fn tick(&mut self, state_changed: bool) -> ReportsDue {
        let full = self.full_every > 0 && self.iteration % self.full_every == 0;
        self.iteration += 1;

        if state_changed && self.countdown < 0 {
            self.countdown = self.cooldown.saturating_add(self.countdown).max(1);
        }
        self.countdown = self.countdown.saturating_sub(1);

        ReportsDue {
            full,
            summary: self.countdown == 0,
        }
    }
}
