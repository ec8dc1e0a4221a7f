use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::SchedulerConfig;
use crate::convert::is_temp_output;
use crate::lock::is_marker_path;
use crate::sidecar;

/// Order in which candidates leave the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Quickest wins first
    #[default]
    SmallestFirst,
    LargestFirst,
    OldestFirst,
    NewestFirst,
    Path,
}

/// A media file eligible for conversion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionCandidate {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub fingerprint: String,
    /// Lower dispatches earlier
    pub priority: i64,
}

impl ConversionCandidate {
    /// Build a candidate from the file's current metadata
    pub fn from_path(path: &Path, order: QueueOrder) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        let size = meta.len();
        let priority = match order {
            QueueOrder::SmallestFirst => size as i64,
            QueueOrder::LargestFirst => -(size as i64),
            QueueOrder::OldestFirst => modified.timestamp_millis(),
            QueueOrder::NewestFirst => -modified.timestamp_millis(),
            QueueOrder::Path => 0,
        };
        Ok(Self {
            path: path.to_path_buf(),
            size,
            modified,
            fingerprint: fingerprint(path, size, modified),
            priority,
        })
    }
}

/// Stable identity of a file version: SHA-256 over path, size and mtime
pub fn fingerprint(path: &Path, size: u64, modified: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(size.to_le_bytes());
    hasher.update(modified.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of a file as it is on disk now
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let meta = fs::metadata(path)?;
    Ok(fingerprint(path, meta.len(), meta.modified()?.into()))
}

/// Decides whether a file still needs converting
pub trait ConversionOracle {
    fn needs_conversion(&self, candidate: &ConversionCandidate) -> Result<bool>;

    /// Called after a converted file has been moved into place
    fn record_converted(&self, output: &Path) -> Result<()>;
}

/// Oracle backed by `.av1skip` / `.av1done` sidecars
#[derive(Debug, Clone, Default)]
pub struct SidecarOracle;

impl ConversionOracle for SidecarOracle {
    fn needs_conversion(&self, candidate: &ConversionCandidate) -> Result<bool> {
        if sidecar::has_skip_marker(&candidate.path) {
            return Ok(false);
        }
        Ok(sidecar::read_done_marker(&candidate.path)?.as_deref() != Some(candidate.fingerprint.as_str()))
    }

    fn record_converted(&self, output: &Path) -> Result<()> {
        let fp = fingerprint_file(output)?;
        sidecar::write_done_marker(output, &fp)
    }
}

/// Counters from one queue build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub entries: usize,
    pub media_files: usize,
    pub candidates: usize,
    pub not_needed: usize,
    pub errors: usize,
}

/// Builds the ordered work queue for one run
pub struct QueueBuilder<'a> {
    cfg: &'a SchedulerConfig,
    oracle: &'a dyn ConversionOracle,
}

impl<'a> QueueBuilder<'a> {
    pub fn new(cfg: &'a SchedulerConfig, oracle: &'a dyn ConversionOracle) -> Self {
        Self { cfg, oracle }
    }

    /// Scan the target directories; `exclude` holds paths already in flight.
    pub fn build(&self, exclude: &HashSet<PathBuf>) -> (VecDeque<ConversionCandidate>, ScanSummary) {
        let extensions = self.cfg.normalized_extensions();
        let mut summary = ScanSummary::default();
        let mut candidates = Vec::new();

        for root in &self.cfg.target_directories {
            if !root.is_dir() {
                warn!("Target directory does not exist: {}", root.display());
                summary.errors += 1;
                continue;
            }
            info!("Scanning directory: {}", root.display());

            for entry in WalkDir::new(root).follow_links(false) {
                summary.entries += 1;
                if summary.entries % 1000 == 0 {
                    debug!("Scanned {} entries so far...", summary.entries);
                }

                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("queue build: unreadable entry: {}", e);
                        summary.errors += 1;
                        continue;
                    }
                };
                let path = entry.path();
                if !entry.file_type().is_file() || !has_media_extension(path, &extensions) {
                    continue;
                }
                if is_marker_path(path) || is_temp_output(path) || sidecar::is_sidecar_path(path) {
                    continue;
                }
                summary.media_files += 1;
                if exclude.contains(path) {
                    continue;
                }

                let candidate = match ConversionCandidate::from_path(path, self.cfg.queue_order) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("queue build: cannot stat path={}: {}", path.display(), e);
                        summary.errors += 1;
                        continue;
                    }
                };
                if candidate.size < self.cfg.min_file_bytes {
                    continue;
                }
                match self.oracle.needs_conversion(&candidate) {
                    Ok(true) => candidates.push(candidate),
                    Ok(false) => summary.not_needed += 1,
                    Err(e) => {
                        warn!("queue build: oracle failed path={}: {:#}", path.display(), e);
                        summary.errors += 1;
                    }
                }
            }
        }

        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.path.cmp(&b.path)));
        summary.candidates = candidates.len();
        info!(
            "queue built: entries={} media={} candidates={} already_done={} errors={}",
            summary.entries, summary.media_files, summary.candidates, summary.not_needed, summary.errors
        );
        (candidates.into(), summary)
    }
}

fn has_media_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|e| *e == ext))
}
