//! Boot reconciliation.
//!
//! Runs once before the control loop. Markers left by this host's dead
//! processes are reclaimed, markers past the TTL are reclaimed from anyone,
//! orphaned temp outputs are deleted and conversions still running from a
//! previous instance are adopted so they count against capacity.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::Utc;
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SchedulerConfig;
use crate::convert::{is_temp_output, source_for_temp};
use crate::executor::AdoptedProcess;
use crate::lock::{marker_path, read_marker, LockManager, LockMarker, ReclaimOutcome};
use crate::process::{matching_signatures, ProcessTable};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Local markers whose owning pid is gone
    pub dead_local_reclaimed: usize,
    /// Markers of any host older than the TTL
    pub stale_reclaimed: usize,
    /// Markers left in place
    pub kept: usize,
    pub temp_removed: usize,
    pub adopted: Vec<AdoptedProcess>,
}

/// Sweep locks, temp outputs and processes under `roots`.
pub fn reconcile(
    locks: &LockManager,
    roots: &[PathBuf],
    processes: &mut dyn ProcessTable,
    cfg: &SchedulerConfig,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    info!("recovery: sweeping {} root(s) host={} pid={}", roots.len(), locks.hostname(), locks.pid());

    for marker in locks.list_markers(roots) {
        match classify(locks, &marker, processes) {
            Verdict::DeadLocal => {
                if reclaim(locks, &marker, "owner pid is not running") {
                    report.dead_local_reclaimed += 1;
                }
            }
            Verdict::Stale => {
                if reclaim(locks, &marker, "older than ttl") {
                    report.stale_reclaimed += 1;
                }
            }
            Verdict::Live => {
                debug!("recovery: keeping lock path={} owner={:?}", marker.media_path().display(), owner(&marker));
                report.kept += 1;
            }
        }
    }

    let live_processes = match processes.list() {
        Ok(p) => p,
        Err(e) => {
            warn!("recovery: cannot list processes, nothing adopted: {}", e);
            Vec::new()
        }
    };
    let now = Utc::now();
    report.adopted = matching_signatures(&live_processes, &cfg.adopt_signatures)
        .into_iter()
        .map(|p| AdoptedProcess {
            pid: p.pid,
            command_line: p.command_line(),
            adopted_at: now,
        })
        .collect();
    for p in &report.adopted {
        info!("adopt: pid={} cmd={:?}", p.pid, p.command_line);
    }

    report.temp_removed = sweep_temp_outputs(roots, &report.adopted);

    info!(
        "recovery: dead_local_reclaimed={} stale_reclaimed={} kept={} temp_removed={} adopted={}",
        report.dead_local_reclaimed,
        report.stale_reclaimed,
        report.kept,
        report.temp_removed,
        report.adopted.len()
    );
    report
}

enum Verdict {
    DeadLocal,
    Stale,
    Live,
}

fn classify(locks: &LockManager, marker: &LockMarker, processes: &mut dyn ProcessTable) -> Verdict {
    if let Some(record) = marker.record.as_ref().filter(|_| locks.is_local(marker)) {
        // Nothing is locked by us yet, so our own pid here is a reused one
        if record.pid == locks.pid() || !processes.is_alive(record.pid) {
            return Verdict::DeadLocal;
        }
    }
    if locks.is_marker_stale(marker) {
        return Verdict::Stale;
    }
    Verdict::Live
}

fn reclaim(locks: &LockManager, marker: &LockMarker, why: &str) -> bool {
    match locks.reclaim(marker) {
        Ok(ReclaimOutcome::Reclaimed) => {
            info!(
                "reclaim: path={} owner={:?} reason={:?}",
                marker.media_path().display(),
                owner(marker),
                why
            );
            true
        }
        Ok(outcome) => {
            debug!("reclaim: path={} skipped ({:?})", marker.media_path().display(), outcome);
            false
        }
        Err(e) => {
            warn!("reclaim: path={} failed: {}", marker.media_path().display(), e);
            false
        }
    }
}

fn owner(marker: &LockMarker) -> Option<(String, u32)> {
    marker.record.as_ref().map(|r| (r.hostname.clone(), r.pid))
}

/// Delete temp outputs nobody is writing; returns how many were removed.
///
/// The source's marker is read again right before each delete, so a job
/// locked by another participant after the marker sweep keeps its temp.
pub(crate) fn sweep_temp_outputs(roots: &[PathBuf], adopted: &[AdoptedProcess]) -> usize {
    let mut removed = 0;
    for root in roots {
        for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() || !is_temp_output(path) {
                continue;
            }
            let path_str = path.to_string_lossy();
            if adopted.iter().any(|a| a.command_line.contains(path_str.as_ref())) {
                debug!("recovery: temp output owned by adopted process: {}", path.display());
                continue;
            }
            if let Some(source) = source_for_temp(path) {
                match marker_path(&source).and_then(|m| read_marker(&m)) {
                    Ok(None) => {}
                    Ok(Some(held)) => {
                        debug!(
                            "recovery: temp output still locked: {} owner={:?}",
                            path.display(),
                            owner(&held)
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!("recovery: keeping temp output {}, lock unreadable: {}", path.display(), e);
                        continue;
                    }
                }
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    info!("recovery: removed orphaned temp output path={}", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("recovery: cannot remove temp output {}: {}", path.display(), e),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::temp_output_path;
    use crate::lock::LockRecord;
    use crate::process::ProcessInfo;
    use crate::testing::FakeProcessTable;
    use std::path::Path;
    use std::time::Duration;

    fn media(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, b"video").unwrap();
        p
    }

    fn marker(media: &Path, host: &str, pid: u32, age_secs: i64) {
        let record = LockRecord::new(host, pid, media, Utc::now() - chrono::Duration::seconds(age_secs));
        fs::write(marker_path(media).unwrap(), serde_json::to_vec(&record).unwrap()).unwrap();
    }

    fn run(dir: &Path, procs: &mut FakeProcessTable) -> RecoveryReport {
        let locks = LockManager::new("host-a", 500, Duration::from_secs(1800));
        reconcile(&locks, &[dir.to_path_buf()], procs, &SchedulerConfig::default())
    }

    #[test]
    fn test_dead_local_reclaimed_live_kept() {
        let dir = tempfile::tempdir().unwrap();
        let dead = media(dir.path(), "dead.mkv");
        let alive = media(dir.path(), "alive.mkv");
        let remote = media(dir.path(), "remote.mkv");
        marker(&dead, "host-a", 111, 10);
        marker(&alive, "host-a", 222, 10);
        // Remote pid liveness is unknowable; only the TTL applies
        marker(&remote, "host-b", 111, 10);

        let mut procs = FakeProcessTable::new(vec![ProcessInfo::new(222, "convd", &["convd"])]);
        let report = run(dir.path(), &mut procs);

        assert_eq!(report.dead_local_reclaimed, 1);
        assert_eq!(report.kept, 2);
        assert!(!marker_path(&dead).unwrap().exists());
        assert!(marker_path(&alive).unwrap().exists());
        assert!(marker_path(&remote).unwrap().exists());
    }

    #[test]
    fn test_stale_markers_reclaimed_from_any_host() {
        let dir = tempfile::tempdir().unwrap();
        let old_remote = media(dir.path(), "old.mkv");
        let old_live_local = media(dir.path(), "mine.mkv");
        marker(&old_remote, "host-b", 1, 7200);
        marker(&old_live_local, "host-a", 222, 7200);

        let mut procs = FakeProcessTable::new(vec![ProcessInfo::new(222, "convd", &["convd"])]);
        let report = run(dir.path(), &mut procs);
        assert_eq!(report.stale_reclaimed, 2);
        assert_eq!(report.kept, 0);
    }

    #[test]
    fn test_own_pid_marker_is_from_a_previous_boot() {
        let dir = tempfile::tempdir().unwrap();
        let f = media(dir.path(), "a.mkv");
        marker(&f, "host-a", 500, 5);
        let mut procs = FakeProcessTable::new(vec![ProcessInfo::new(500, "convd", &["convd"])]);
        assert_eq!(run(dir.path(), &mut procs).dead_local_reclaimed, 1);
    }

    #[test]
    fn test_orphaned_temp_outputs_removed() {
        let dir = tempfile::tempdir().unwrap();
        let orphan_src = media(dir.path(), "orphan.mp4");
        let locked_src = media(dir.path(), "busy.mkv");
        let orphan_tmp = temp_output_path(&orphan_src, "mkv");
        let locked_tmp = temp_output_path(&locked_src, "mkv");
        fs::write(&orphan_tmp, b"partial").unwrap();
        fs::write(&locked_tmp, b"partial").unwrap();
        marker(&locked_src, "host-b", 9, 10);

        let report = run(dir.path(), &mut FakeProcessTable::default());
        assert_eq!(report.temp_removed, 1);
        assert!(!orphan_tmp.exists());
        assert!(locked_tmp.exists());
        assert!(orphan_src.exists());
    }

    #[test]
    fn test_running_conversions_are_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let src = media(dir.path(), "ext.mkv");
        let tmp = temp_output_path(&src, "mkv");
        fs::write(&tmp, b"partial").unwrap();
        let tmp_arg = tmp.to_string_lossy().into_owned();

        let mut procs = FakeProcessTable::new(vec![
            ProcessInfo::new(324, "ffmpeg", &["ffmpeg", "-i", "ext.mkv", &tmp_arg]),
            ProcessInfo::new(321, "ffmpeg", &["ffmpeg", "-i", "ext.mkv", &tmp_arg]),
            ProcessInfo::new(322, "bash", &["bash"]),
            // Encoder worker threads reported as tasks of their own
            ProcessInfo::new(323, "ffmpeg", &["ffmpeg", "-i", "ext.mkv", &tmp_arg]),
        ]);
        let report = run(dir.path(), &mut procs);
        assert_eq!(report.adopted.len(), 1);
        assert_eq!(report.adopted[0].pid, 321);
        // Its output is still being written
        assert!(tmp.exists());
        assert_eq!(report.temp_removed, 0);
    }

    /// Locks `media` from another host the moment processes are listed,
    /// which falls between the marker sweep and the temp sweep.
    struct LockedDuringSweep {
        media: PathBuf,
        inner: FakeProcessTable,
    }

    impl ProcessTable for LockedDuringSweep {
        fn list(&mut self) -> std::io::Result<Vec<ProcessInfo>> {
            if !marker_path(&self.media).unwrap().exists() {
                marker(&self.media, "host-b", 77, 0);
            }
            self.inner.list()
        }
    }

    #[test]
    fn test_temp_of_file_locked_after_marker_sweep_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let src = media(dir.path(), "late.mp4");
        let tmp = temp_output_path(&src, "mkv");
        fs::write(&tmp, b"just started").unwrap();

        let locks = LockManager::new("host-a", 500, Duration::from_secs(1800));
        let mut procs = LockedDuringSweep {
            media: src.clone(),
            inner: FakeProcessTable::default(),
        };
        let report = reconcile(&locks, &[dir.path().to_path_buf()], &mut procs, &SchedulerConfig::default());

        assert_eq!(report.kept, 0);
        assert_eq!(report.temp_removed, 0);
        assert!(tmp.exists());
    }

    #[test]
    fn test_sweep_removes_temp_once_lock_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let src = media(dir.path(), "a.mkv");
        let tmp = temp_output_path(&src, "mkv");
        fs::write(&tmp, b"partial").unwrap();
        marker(&src, "host-b", 9, 10);
        let roots = [dir.path().to_path_buf()];

        assert_eq!(sweep_temp_outputs(&roots, &[]), 0);
        fs::remove_file(marker_path(&src).unwrap()).unwrap();
        assert_eq!(sweep_temp_outputs(&roots, &[]), 1);
        assert!(!tmp.exists());
    }
}
