//! Lock markers on shared storage
//!
//! A marker is a small JSON file created next to the media file with an
//! atomic create-if-absent open. Its fields are the protocol every
//! participant on every host reads and writes:
//!
//! ```json
//! {"hostname": "nas1", "pid": 4242, "timestamp": 1718000000.5,
//!  "file": "/media/tv/show.mkv", "locked_at": "2024-06-10T06:13:20.500+00:00"}
//! ```
//!
//! Unknown fields are ignored when reading.
//!
//! Over a network filesystem `O_EXCL` is only as good as the server makes it,
//! and there is no fencing token: a reclaimed marker cannot tell a dead owner
//! from one that comes back after a partition. Mutual exclusion here is
//! best-effort.
//!
//! Reclaim and release never delete a marker in place. The marker is renamed
//! to a unique `<marker>.reclaim-<uuid>` tombstone, checked there, and linked
//! back if it turned out to belong to someone else. A marker created by a
//! third participant while the original is set aside still wins over the
//! restore, and the displaced owner learns of it only on release.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::SchedulerConfig;
use crate::error::LockError;

/// Suffix appended to the media file name to form its marker
pub const LOCK_SUFFIX: &str = ".convlock";

/// Contents of a lock marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub hostname: String,
    pub pid: u32,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub file: PathBuf,
    pub locked_at: String,
}

impl LockRecord {
    pub fn new(hostname: &str, pid: u32, file: &Path, now: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.to_string(),
            pid,
            timestamp: now.timestamp_millis() as f64 / 1000.0,
            file: file.to_path_buf(),
            locked_at: now.to_rfc3339(),
        }
    }

    /// Age relative to `now`; negative ages (clock skew) count as zero and
    /// ages beyond what a `Duration` holds saturate.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        if !self.has_valid_timestamp() {
            return Duration::MAX;
        }
        let now_secs = now.timestamp_millis() as f64 / 1000.0;
        Duration::try_from_secs_f64((now_secs - self.timestamp).max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Whether `timestamp` is a usable epoch time
    pub fn has_valid_timestamp(&self) -> bool {
        self.timestamp.is_finite() && self.timestamp >= 0.0
    }
}

/// A marker found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct LockMarker {
    pub marker_path: PathBuf,
    /// `None` when the file exists but does not hold a valid record yet
    pub record: Option<LockRecord>,
    pub modified: Option<SystemTime>,
}

impl LockMarker {
    /// Media file the marker guards
    pub fn media_path(&self) -> PathBuf {
        match &self.record {
            Some(r) => r.file.clone(),
            None => media_path_for_marker(&self.marker_path),
        }
    }

    fn age_at(&self, now: DateTime<Utc>) -> Duration {
        match (&self.record, self.modified) {
            (Some(r), _) if r.has_valid_timestamp() => r.age_at(now),
            (_, Some(mtime)) => SystemTime::from(now).duration_since(mtime).unwrap_or_default(),
            (_, None) => Duration::ZERO,
        }
    }
}

/// Outcome of [`LockManager::acquire`]
#[derive(Debug)]
pub enum Acquire {
    Acquired(LockHandle),
    /// Someone else holds a live marker
    AlreadyLocked(LockMarker),
}

/// Outcome of [`LockManager::reclaim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Reclaimed,
    /// The marker was already removed by someone else
    AlreadyGone,
    /// The marker now holds a different record and was left alone
    Superseded,
}

/// Held lock. Releases its marker when dropped.
#[derive(Debug)]
pub struct LockHandle {
    marker_path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockHandle {
    pub fn media_path(&self) -> &Path {
        &self.record.file
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Remove the marker if it still carries our record.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        release_marker(&self.marker_path, &self.record)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release_marker(&self.marker_path, &self.record) {
            warn!("release failed on drop: {}", e);
        }
    }
}

fn release_marker(marker_path: &Path, ours: &LockRecord) -> Result<(), LockError> {
    match read_marker(marker_path)? {
        None => {
            warn!(
                "release: marker already gone path={} (reclaimed by another participant?)",
                marker_path.display()
            );
            Ok(())
        }
        Some(marker) if marker.record.as_ref() == Some(ours) => {
            match take_marker_if(marker_path, Some(ours))? {
                ReclaimOutcome::Reclaimed => debug!("release: path={}", ours.file.display()),
                outcome => warn!(
                    "release: marker changed under us ({:?}), leaving it path={}",
                    outcome,
                    marker_path.display()
                ),
            }
            Ok(())
        }
        Some(marker) => {
            warn!(
                "release: marker now owned by {:?}, leaving it path={}",
                marker.record.map(|r| (r.hostname, r.pid)),
                marker_path.display()
            );
            Ok(())
        }
    }
}

/// Move a marker aside and delete it only if it still holds `expected`.
///
/// A marker holding anything else is linked back into place.
fn take_marker_if(marker_path: &Path, expected: Option<&LockRecord>) -> Result<ReclaimOutcome, LockError> {
    let io_err = |source| LockError::Io {
        path: marker_path.to_path_buf(),
        source,
    };
    let name = marker_path
        .file_name()
        .ok_or_else(|| LockError::NoFileName(marker_path.to_path_buf()))?
        .to_string_lossy();
    let tombstone = marker_path.with_file_name(format!("{}.reclaim-{}", name, uuid::Uuid::new_v4()));

    match fs::rename(marker_path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ReclaimOutcome::AlreadyGone),
        Err(e) => return Err(io_err(e)),
    }

    let taken = read_marker(&tombstone);
    let is_expected = matches!(&taken, Ok(Some(m)) if m.record.as_ref() == expected);
    if !is_expected {
        restore_marker(&tombstone, marker_path);
    }
    if let Err(e) = fs::remove_file(&tombstone) {
        if e.kind() != ErrorKind::NotFound {
            warn!("could not remove lock tombstone {}: {}", tombstone.display(), e);
        }
    }

    match taken? {
        None => Ok(ReclaimOutcome::AlreadyGone),
        Some(_) if is_expected => Ok(ReclaimOutcome::Reclaimed),
        Some(_) => Ok(ReclaimOutcome::Superseded),
    }
}

fn restore_marker(tombstone: &Path, marker_path: &Path) {
    match fs::hard_link(tombstone, marker_path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => warn!(
            "lock marker {} was re-created while set aside; the displaced record is dropped",
            marker_path.display()
        ),
        Err(_) if !marker_path.exists() => {
            // No hard links on this filesystem
            if let Err(e) = fs::rename(tombstone, marker_path) {
                warn!("could not restore lock marker {}: {}", marker_path.display(), e);
            }
        }
        Err(e) => warn!("could not restore lock marker {}: {}", marker_path.display(), e),
    }
}

/// Path of the marker guarding a media file
pub fn marker_path(media: &Path) -> Result<PathBuf, LockError> {
    let name = media
        .file_name()
        .ok_or_else(|| LockError::NoFileName(media.to_path_buf()))?;
    let mut marker_name = name.to_os_string();
    marker_name.push(LOCK_SUFFIX);
    Ok(media.with_file_name(marker_name))
}

/// Inverse of [`marker_path`]
pub fn media_path_for_marker(marker: &Path) -> PathBuf {
    let name = marker
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stripped = name.strip_suffix(LOCK_SUFFIX).unwrap_or(&name);
    marker.with_file_name(stripped)
}

pub fn is_marker_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(LOCK_SUFFIX))
}

/// Read a marker; `Ok(None)` if it does not exist.
pub fn read_marker(marker_path: &Path) -> Result<Option<LockMarker>, LockError> {
    let io_err = |source| LockError::Io {
        path: marker_path.to_path_buf(),
        source,
    };
    let content = match fs::read(marker_path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(e)),
    };
    let modified = match fs::metadata(marker_path) {
        Ok(m) => m.modified().ok(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(e)),
    };
    let record = match serde_json::from_slice::<LockRecord>(&content) {
        Ok(r) => Some(r),
        Err(e) => {
            debug!("unreadable lock marker {}: {}", marker_path.display(), e);
            None
        }
    };
    Ok(Some(LockMarker {
        marker_path: marker_path.to_path_buf(),
        record,
        modified,
    }))
}

/// Creates, inspects and reclaims lock markers for this host and process.
#[derive(Debug, Clone)]
pub struct LockManager {
    hostname: String,
    pid: u32,
    ttl: Duration,
}

impl LockManager {
    pub fn new(hostname: impl Into<String>, pid: u32, ttl: Duration) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
            ttl,
        }
    }

    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self::new(resolve_hostname(cfg), std::process::id(), cfg.lock_ttl())
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    /// Try to take the lock for a media file without blocking.
    pub fn acquire(&self, media: &Path) -> Result<Acquire, LockError> {
        let marker = marker_path(media)?;

        // Second pass only happens after reclaiming a stale marker
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&marker) {
                Ok(file) => {
                    let record = LockRecord::new(&self.hostname, self.pid, media, Utc::now());
                    if let Err(e) = write_record(file, &marker, &record) {
                        let _ = fs::remove_file(&marker);
                        return Err(e);
                    }
                    debug!("acquire: path={} host={} pid={}", media.display(), self.hostname, self.pid);
                    return Ok(Acquire::Acquired(LockHandle {
                        marker_path: marker,
                        record,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let existing = match read_marker(&marker)? {
                        Some(m) => m,
                        // Released between our open and our read
                        None => continue,
                    };
                    if attempt == 0 && self.is_marker_stale(&existing) {
                        info!(
                            "reclaim: stale lock path={} owner={:?} age={}s",
                            media.display(),
                            existing.record.as_ref().map(|r| (&r.hostname, r.pid)),
                            existing.age_at(Utc::now()).as_secs()
                        );
                        self.reclaim(&existing)?;
                        continue;
                    }
                    return Ok(Acquire::AlreadyLocked(existing));
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: marker.clone(),
                        source,
                    })
                }
            }
        }

        let existing = read_marker(&marker)?.unwrap_or(LockMarker {
            marker_path: marker,
            record: None,
            modified: None,
        });
        Ok(Acquire::AlreadyLocked(existing))
    }

    /// Whether a record is older than the TTL
    pub fn is_stale(&self, record: &LockRecord) -> bool {
        record.age_at(Utc::now()) > self.ttl
    }

    /// Staleness of a marker, using file mtime when the record is unreadable
    pub fn is_marker_stale(&self, marker: &LockMarker) -> bool {
        marker.age_at(Utc::now()) > self.ttl
    }

    /// Whether a marker belongs to this host
    pub fn is_local(&self, marker: &LockMarker) -> bool {
        marker
            .record
            .as_ref()
            .is_some_and(|r| r.hostname == self.hostname)
    }

    /// Delete a stale or dead-owner marker.
    ///
    /// Any participant may reclaim. A marker that is already gone yields
    /// [`ReclaimOutcome::AlreadyGone`].
    pub fn reclaim(&self, marker: &LockMarker) -> Result<ReclaimOutcome, LockError> {
        let current = match read_marker(&marker.marker_path)? {
            None => return Ok(ReclaimOutcome::AlreadyGone),
            Some(c) => c,
        };
        if current.record != marker.record {
            return Ok(ReclaimOutcome::Superseded);
        }
        take_marker_if(&marker.marker_path, marker.record.as_ref())
    }

    /// Every marker under the given roots
    pub fn list_markers(&self, roots: &[PathBuf]) -> Vec<LockMarker> {
        let mut markers = Vec::new();
        for root in roots {
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Error reading directory entry while listing locks: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() || !is_marker_path(entry.path()) {
                    continue;
                }
                match read_marker(entry.path()) {
                    Ok(Some(m)) => markers.push(m),
                    Ok(None) => {}
                    Err(e) => warn!("{}", e),
                }
            }
        }
        markers
    }
}

fn write_record(mut file: fs::File, marker: &Path, record: &LockRecord) -> Result<(), LockError> {
    let body = serde_json::to_vec(record).map_err(|source| LockError::Encode {
        path: marker.to_path_buf(),
        source,
    })?;
    file.write_all(&body)
        .and_then(|_| file.sync_all())
        .map_err(|source| LockError::Io {
            path: marker.to_path_buf(),
            source,
        })
}

/// Hostname used in lock markers: config override, then the OS name
pub fn resolve_hostname(cfg: &SchedulerConfig) -> String {
    cfg.hostname
        .clone()
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "localhost".to_string())
}
