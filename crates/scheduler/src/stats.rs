//! Progress statistics and the snapshot file read by external monitors.
//!
//! The snapshot is rewritten every tick by writing a fresh file in the same
//! directory and renaming it over the old one, so a reader always sees a
//! complete document.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::ResourceSample;

const MAX_FAILURES: usize = 50;

/// One failed conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub path: PathBuf,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub queued: usize,
    pub active: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Machine-readable progress document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub hostname: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub target_jobs: usize,
    pub counts: Counts,
    pub throughput_per_hour: f64,
    pub eta_seconds: Option<u64>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub paused: Option<String>,
    pub draining: bool,
    pub last_sample: Option<ResourceSample>,
    pub recent_failures: Vec<FailureRecord>,
}

/// Runtime facts the snapshot needs besides the counters
#[derive(Debug, Clone)]
pub struct SnapshotContext<'a> {
    pub hostname: &'a str,
    pub pid: u32,
    pub queued: usize,
    pub active: usize,
    pub target_jobs: usize,
    pub paused: Option<String>,
    pub draining: bool,
    pub last_sample: Option<&'a ResourceSample>,
}

/// Cumulative counters and the sliding completion window
#[derive(Debug, Clone)]
pub struct Statistics {
    started_at: DateTime<Utc>,
    window: Duration,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    completions: VecDeque<DateTime<Utc>>,
    failures: VecDeque<FailureRecord>,
}

impl Statistics {
    pub fn new(window: Duration, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            window,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            completions: VecDeque::new(),
            failures: VecDeque::new(),
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.succeeded += 1;
        self.completions.push_back(at);
    }

    pub fn record_failure(&mut self, path: &Path, error: &str, at: DateTime<Utc>) {
        self.failed += 1;
        self.completions.push_back(at);
        self.failures.push_back(FailureRecord {
            path: path.to_path_buf(),
            error: error.to_string(),
            at,
        });
        while self.failures.len() > MAX_FAILURES {
            self.failures.pop_front();
        }
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter()
    }

    /// Finished conversions per hour over the recent window
    pub fn throughput_per_hour(&mut self, now: DateTime<Utc>) -> f64 {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::hours(1));
        let cutoff = now - window;
        while self.completions.front().is_some_and(|t| *t < cutoff) {
            self.completions.pop_front();
        }
        // Young processes divide by their uptime, not the full window
        let span = (now - self.started_at).min(window);
        let hours = span.num_milliseconds() as f64 / 3_600_000.0;
        if hours <= 0.0 {
            return 0.0;
        }
        self.completions.len() as f64 / hours
    }

    pub fn snapshot(&mut self, ctx: &SnapshotContext<'_>, now: DateTime<Utc>) -> StatsSnapshot {
        let throughput = self.throughput_per_hour(now);
        let remaining = ctx.queued + ctx.active;
        let eta_seconds = if remaining == 0 {
            Some(0)
        } else if throughput > 0.0 {
            Some((remaining as f64 / throughput * 3600.0).round() as u64)
        } else {
            None
        };
        let estimated_completion =
            eta_seconds.and_then(|s| chrono::Duration::try_seconds(s as i64).map(|d| now + d));

        StatsSnapshot {
            hostname: ctx.hostname.to_string(),
            pid: ctx.pid,
            started_at: self.started_at,
            updated_at: now,
            target_jobs: ctx.target_jobs,
            counts: Counts {
                queued: ctx.queued,
                active: ctx.active,
                succeeded: self.succeeded,
                failed: self.failed,
                skipped: self.skipped,
            },
            throughput_per_hour: throughput,
            eta_seconds,
            estimated_completion,
            paused: ctx.paused.clone(),
            draining: ctx.draining,
            last_sample: ctx.last_sample.cloned(),
            recent_failures: self.failures.iter().cloned().collect(),
        }
    }
}

/// Replace the snapshot file atomically.
pub fn write_snapshot(path: &Path, snapshot: &StatsSnapshot) -> Result<()> {
    let data = serde_json::to_vec_pretty(snapshot).context("Failed to encode stats snapshot")?;
    atomic_write(path, &data)
}

/// Read a snapshot written by [`write_snapshot`]
pub fn load_snapshot(path: &Path) -> Result<StatsSnapshot> {
    let content = fs::read(path)
        .with_context(|| format!("Failed to read stats snapshot: {}", path.display()))?;
    serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse stats snapshot: {}", path.display()))
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("Snapshot path has no parent directory: {}", path.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("Snapshot path has no file name: {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        file_name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));
    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
        file.write_all(data)
            .and_then(|_| file.sync_all())
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!("Failed to move {} over {}", tmp_path.display(), path.display())
        })
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
