//! End-to-end runs of the control loop against fake system seams.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use scheduler::convert::temp_output_path;
use scheduler::coordinator::{Collaborators, Coordinator};
use scheduler::lock::{marker_path, read_marker, Acquire, LockManager};
use scheduler::queue::SidecarOracle;
use scheduler::testing::{FakeConverter, FakeOutcome, FakeProbe, FakeProcessTable};
use scheduler::SchedulerConfig;

const GIB: u64 = 1024 * 1024 * 1024;

fn media_files(dir: &Path, n: usize) -> Vec<PathBuf> {
    (0..n)
        .map(|i| {
            let p = dir.join(format!("movie{i:02}.mkv"));
            fs::write(&p, vec![7u8; 1000 + i]).unwrap();
            p
        })
        .collect()
}

fn config(media: &Path, state: &Path, max_jobs: usize) -> SchedulerConfig {
    SchedulerConfig {
        target_directories: vec![media.to_path_buf()],
        state_dir: state.to_path_buf(),
        max_parallel_jobs: max_jobs,
        min_parallel_jobs: 1,
        ..Default::default()
    }
}

fn instance(
    cfg: SchedulerConfig,
    host: &str,
    pid: u32,
    probe: FakeProbe,
    converter: FakeConverter,
) -> Coordinator {
    Coordinator::with_locks(
        cfg,
        Collaborators {
            probe: Box::new(probe),
            processes: Box::new(FakeProcessTable::default()),
            converter: Box::new(converter),
            oracle: Box::new(SidecarOracle),
        },
        LockManager::new(host, pid, Duration::from_secs(1800)),
    )
}

#[test]
fn scenario_sustains_max_parallel_jobs_until_queue_empty() {
    let media = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let files = media_files(media.path(), 10);
    let conv = FakeConverter::new(FakeOutcome::Succeed { after_polls: 1 });
    let mut c = instance(config(media.path(), state.path(), 4), "host-a", 1, FakeProbe::idle(), conv.clone());
    c.boot();

    let first = c.tick();
    assert_eq!(first.started.len(), 4);

    let mut completed = 0;
    for _ in 0..20 {
        let report = c.tick();
        completed += report.finished.len();
        assert!(report.active <= 4);
        assert_eq!(report.active, 4.min(10 - completed));
        if report.active == 0 && report.queued == 0 {
            break;
        }
    }
    assert_eq!(completed, 10);
    assert_eq!(conv.spawned().len(), 10);
    assert_eq!(c.executor().stats().succeeded(), 10);
    for f in files {
        assert_eq!(fs::read(&f).unwrap(), b"converted");
        assert!(!marker_path(&f).unwrap().exists());
    }
}

#[test]
fn scenario_two_instances_convert_each_file_once() {
    let media = tempfile::tempdir().unwrap();
    let state_a = tempfile::tempdir().unwrap();
    let state_b = tempfile::tempdir().unwrap();
    media_files(media.path(), 2);

    let conv_a = FakeConverter::new(FakeOutcome::Succeed { after_polls: 1 });
    let conv_b = conv_a.sharing_history(FakeOutcome::Succeed { after_polls: 1 });
    let mut a = instance(config(media.path(), state_a.path(), 1), "host-a", 10, FakeProbe::idle(), conv_a.clone());
    let mut b = instance(config(media.path(), state_b.path(), 1), "host-b", 20, FakeProbe::idle(), conv_b);
    a.boot();
    b.boot();

    for _ in 0..20 {
        let ra = a.tick();
        let rb = b.tick();
        if ra.active + ra.queued + rb.active + rb.queued == 0 {
            break;
        }
    }

    let spawned = conv_a.spawned();
    assert_eq!(spawned.len(), 2, "spawned: {:?}", spawned);
    let unique: HashSet<_> = spawned.iter().collect();
    assert_eq!(unique.len(), 2);
    assert_eq!(
        a.executor().stats().succeeded() + b.executor().stats().succeeded(),
        2
    );
}

#[test]
fn scenario_restart_reclaims_own_dead_lock_and_keeps_remote() {
    let media = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let files = media_files(media.path(), 2);

    // Crashed earlier run of this host: its marker and partial output survive
    match LockManager::new("host-a", 111, Duration::from_secs(1800)).acquire(&files[0]).unwrap() {
        Acquire::Acquired(handle) => std::mem::forget(handle),
        Acquire::AlreadyLocked(_) => unreachable!(),
    }
    let orphan = temp_output_path(&files[0], "mkv");
    fs::write(&orphan, b"half an encode").unwrap();

    // A genuine remote instance working on the other file
    let remote = match LockManager::new("host-b", 222, Duration::from_secs(1800)).acquire(&files[1]).unwrap() {
        Acquire::Acquired(handle) => handle,
        Acquire::AlreadyLocked(_) => unreachable!(),
    };
    let remote_tmp = temp_output_path(&files[1], "mkv");
    fs::write(&remote_tmp, b"in progress").unwrap();

    let conv = FakeConverter::new(FakeOutcome::Succeed { after_polls: 0 });
    let mut c = instance(config(media.path(), state.path(), 2), "host-a", 333, FakeProbe::idle(), conv.clone());
    let report = c.boot();

    assert_eq!(report.dead_local_reclaimed, 1);
    assert_eq!(report.stale_reclaimed, 0);
    assert_eq!(report.kept, 1);
    assert_eq!(report.temp_removed, 1);
    assert!(!orphan.exists());
    assert!(remote_tmp.exists());
    let still_held = read_marker(remote.marker_path()).unwrap().unwrap();
    assert_eq!(still_held.record.unwrap().hostname, "host-b");

    // The reclaimed file is picked up again, the remote one is left alone
    let tick = c.tick();
    assert_eq!(tick.started, vec![files[0].clone()]);
    assert_eq!(conv.spawned(), vec![files[0].clone()]);
}

#[test]
fn scenario_memory_floor_pauses_dispatch_until_recovered() {
    let media = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    media_files(media.path(), 5);

    let probe = FakeProbe::new(10.0, 64 * GIB, 32 * GIB, 0.5);
    let conv = FakeConverter::new(FakeOutcome::Succeed { after_polls: 2 });
    let cfg = SchedulerConfig {
        scale_up_samples: 1,
        ..config(media.path(), state.path(), 2)
    };
    let mut c = instance(cfg, "host-a", 1, probe.clone(), conv.clone());
    c.boot();
    assert_eq!(c.tick().started.len(), 2);

    probe.set_available(GIB);
    let mut finished = 0;
    for _ in 0..5 {
        let report = c.tick();
        assert_eq!(report.decision.target, 0);
        assert!(report.started.is_empty());
        let reason = report.paused.expect("paused while memory is low");
        assert!(reason.starts_with("critical_memory_pressure"));
        finished += report.finished.len();
    }
    // Running jobs were allowed to finish
    assert_eq!(finished, 2);
    assert_eq!(conv.spawned().len(), 2);

    probe.set_available(32 * GIB);
    let resumed = c.tick();
    assert!(resumed.paused.is_none());
    assert_eq!(resumed.started.len(), 2);
}
