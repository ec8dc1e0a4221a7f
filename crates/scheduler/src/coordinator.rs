//! The per-host control loop.
//!
//! One tick: sample → decide → reap → dispatch → publish statistics. The
//! loop only sleeps between ticks, waking early when a signal arrives.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use humansize::{format_size, BINARY};
use log::{debug, error, info, warn};
use tokio::sync::Notify;

use crate::config::SchedulerConfig;
use crate::convert::Converter;
use crate::error::ConfigError;
use crate::executor::{Completion, JobExecutor};
use crate::lock::LockManager;
use crate::monitor::{ResourceMonitor, ResourceSample, SystemProbe};
use crate::policy::{Decision, PressureReason, ScalingPolicy};
use crate::process::ProcessTable;
use crate::queue::{ConversionOracle, QueueBuilder};
use crate::recovery::{self, RecoveryReport};
use crate::stats::{self, SnapshotContext, Statistics};

/// How long terminated children get to exit
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// The system seams a coordinator runs against
pub struct Collaborators {
    pub probe: Box<dyn SystemProbe>,
    pub processes: Box<dyn ProcessTable>,
    pub converter: Box<dyn Converter>,
    pub oracle: Box<dyn ConversionOracle>,
}

/// Signals delivered to a running loop.
///
/// The first stop request drains, the second terminates.
#[derive(Debug, Clone, Default)]
pub struct Control {
    inner: Arc<ControlInner>,
}

#[derive(Debug, Default)]
struct ControlInner {
    stops: AtomicU32,
    reload: AtomicBool,
    notify: Notify,
}

impl Control {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many stops have been requested so far
    pub fn request_stop(&self) -> u32 {
        let n = self.inner.stops.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.notify.notify_one();
        n
    }

    pub fn stop_requests(&self) -> u32 {
        self.inner.stops.load(Ordering::SeqCst)
    }

    pub fn request_reload(&self) {
        self.inner.reload.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    fn take_reload(&self) -> bool {
        self.inner.reload.swap(false, Ordering::SeqCst)
    }

    async fn wait(&self) {
        self.inner.notify.notified().await
    }
}

/// Why [`Coordinator::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `--once` and nothing left to do
    Completed,
    /// Stopped after the running jobs finished
    Drained,
    /// Children were killed on a second stop request
    Terminated,
}

/// What one tick did
#[derive(Debug, Clone)]
pub struct TickReport {
    pub sample: ResourceSample,
    pub decision: Decision,
    pub finished: Vec<Completion>,
    pub started: Vec<PathBuf>,
    pub queued: usize,
    pub active: usize,
    pub paused: Option<String>,
}

pub struct Coordinator {
    cfg: SchedulerConfig,
    config_path: Option<PathBuf>,
    monitor: ResourceMonitor,
    policy: ScalingPolicy,
    executor: JobExecutor,
    hostname: String,
    pid: u32,
    last_queue_build: Option<Instant>,
    /// Keep looking for new files once the queue is empty
    daemon: bool,
    target: usize,
    paused: Option<String>,
}

impl Coordinator {
    pub fn new(cfg: SchedulerConfig, parts: Collaborators) -> Self {
        let locks = LockManager::from_config(&cfg);
        Self::with_locks(cfg, parts, locks)
    }

    /// Build with an explicit lock identity
    pub fn with_locks(cfg: SchedulerConfig, parts: Collaborators, locks: LockManager) -> Self {
        let hostname = locks.hostname().to_string();
        let pid = locks.pid();
        let stats = Statistics::new(cfg.throughput_window(), Utc::now());
        Self {
            monitor: ResourceMonitor::new(parts.probe, parts.processes, &cfg),
            policy: ScalingPolicy::new(&cfg),
            executor: JobExecutor::new(locks, parts.converter, parts.oracle, &cfg.output_extension, stats),
            cfg,
            config_path: None,
            hostname,
            pid,
            last_queue_build: None,
            daemon: true,
            target: 0,
            paused: None,
        }
    }

    /// File re-read on a reload request
    pub fn set_config_path(&mut self, path: Option<PathBuf>) {
        self.config_path = path;
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Reconcile leftovers from earlier runs and build the first queue.
    pub fn boot(&mut self) -> RecoveryReport {
        let roots = self.cfg.valid_target_directories();
        let report = recovery::reconcile(
            self.executor.locks(),
            &roots,
            self.monitor.process_table(),
            &self.cfg,
        );
        self.executor.adopt(report.adopted.clone());
        self.rebuild_queue();
        report
    }

    pub fn rebuild_queue(&mut self) {
        let exclude = self.executor.excluded_paths();
        let (queue, summary) = QueueBuilder::new(&self.cfg, self.executor.oracle()).build(&exclude);
        debug!("queue rebuilt: {:?}", summary);
        self.executor.replace_queue(queue);
        self.last_queue_build = Some(Instant::now());
    }

    fn queue_due(&self) -> bool {
        let Some(at) = self.last_queue_build else {
            return true;
        };
        let elapsed = at.elapsed();
        if elapsed >= self.cfg.queue_refresh_interval() {
            return true;
        }
        // A dry queue is rescanned at most once per check interval
        self.daemon && self.executor.queue_len() == 0 && elapsed >= self.cfg.check_interval()
    }

    /// One pass of the control loop.
    pub fn tick(&mut self) -> TickReport {
        let sample = self.monitor.sample();
        let decision = self.policy.update(&sample, &self.cfg);
        self.target = decision.target;
        self.paused = self.pause_reason(&sample, &decision);

        let finished = self.executor.reap();
        self.executor.reap_adopted(self.monitor.last_processes());

        if !self.executor.is_draining() && self.queue_due() {
            self.rebuild_queue();
        }
        let started = self.executor.dispatch(decision.target);

        info!(
            "tick: cpu={:.1}% mem={:.1}% avail={} load={:.2} priority={} proposed={} target={} active={} queued={} reasons={}",
            sample.cpu_percent,
            sample.memory_percent(),
            format_size(sample.available_memory_bytes, BINARY),
            sample.load_average_1m,
            sample.priority_process_active,
            decision.proposed,
            decision.target,
            self.executor.active_count(),
            self.executor.queue_len(),
            decision.reasons_label()
        );

        self.publish_stats();
        TickReport {
            sample,
            decision,
            finished,
            started,
            queued: self.executor.queue_len(),
            active: self.executor.active_count(),
            paused: self.paused.clone(),
        }
    }

    fn pause_reason(&self, sample: &ResourceSample, decision: &Decision) -> Option<String> {
        if decision.is_memory_critical() {
            let reason = format!(
                "critical_memory_pressure: available {} below floor {}",
                format_size(sample.available_memory_bytes, BINARY),
                format_size(self.cfg.min_available_memory_bytes(), BINARY)
            );
            warn!(
                "pause: reason=critical_memory_pressure available={} floor={} running={}",
                sample.available_memory_bytes,
                self.cfg.min_available_memory_bytes(),
                self.executor.running().len()
            );
            return Some(reason);
        }
        if decision.target == 0 && decision.reasons.contains(&PressureReason::PriorityProcess) {
            info!("pause: reason=priority_process running={}", self.executor.running().len());
            return Some("priority process active".to_string());
        }
        None
    }

    fn publish_stats(&mut self) {
        let ctx = SnapshotContext {
            hostname: &self.hostname,
            pid: self.pid,
            queued: self.executor.queue_len(),
            active: self.executor.active_count(),
            target_jobs: self.target,
            paused: self.paused.clone(),
            draining: self.executor.is_draining(),
            last_sample: self.monitor.last_sample(),
        };
        let snapshot = self.executor.stats_mut().snapshot(&ctx, Utc::now());
        if let Err(e) = stats::write_snapshot(&self.cfg.stats_path(), &snapshot) {
            warn!("stats: could not write snapshot: {:#}", e);
        }
    }

    /// Swap in a new configuration; an invalid one leaves the current one in place.
    pub fn reload(&mut self, cfg: SchedulerConfig) -> Result<(), ConfigError> {
        cfg.validate()?;
        if cfg.encoder_command != self.cfg.encoder_command || cfg.output_extension != self.cfg.output_extension {
            warn!("reload: encoder_command and output_extension take effect on restart only");
        }
        if cfg.hostname != self.cfg.hostname {
            warn!("reload: hostname takes effect on restart only");
        }
        if cfg.target_directories != self.cfg.target_directories
            || cfg.video_extensions != self.cfg.video_extensions
            || cfg.queue_order != self.cfg.queue_order
            || cfg.min_file_bytes != self.cfg.min_file_bytes
        {
            self.last_queue_build = None;
        }
        self.monitor.reconfigure(&cfg);
        self.policy.reconfigure(&cfg);
        self.executor.locks_mut().set_ttl(cfg.lock_ttl());
        self.executor.stats_mut().set_window(cfg.throughput_window());
        self.cfg = SchedulerConfig {
            encoder_command: self.cfg.encoder_command.clone(),
            output_extension: self.cfg.output_extension.clone(),
            hostname: self.cfg.hostname.clone(),
            ..cfg
        };
        info!(
            "reload: applied max_parallel_jobs={} min_parallel_jobs={} check_interval={}s",
            self.cfg.max_parallel_jobs, self.cfg.min_parallel_jobs, self.cfg.check_interval
        );
        Ok(())
    }

    fn reload_from_disk(&mut self) {
        match SchedulerConfig::load_config(self.config_path.as_deref()) {
            Ok(cfg) => {
                if let Err(e) = self.reload(cfg) {
                    error!("reload: rejected, keeping previous configuration: {}", e);
                }
            }
            Err(e) => error!("reload: rejected, keeping previous configuration: {}", e),
        }
    }

    /// Run ticks until the work is done or a stop request ends the loop.
    pub async fn run(&mut self, control: &Control, once: bool) -> Result<RunOutcome> {
        self.daemon = !once;
        loop {
            if control.take_reload() {
                self.reload_from_disk();
            }

            let stops = control.stop_requests();
            if stops >= 2 {
                warn!("terminate: killing {} running job(s)", self.executor.running().len());
                let killed = self.executor.terminate_all(TERMINATE_GRACE).await;
                info!("terminate: {} job(s) stopped, locks released", killed.len());
                self.publish_stats();
                return Ok(RunOutcome::Terminated);
            }
            if stops == 1 && !self.executor.is_draining() {
                self.executor.begin_drain();
                info!("drain: send the signal again to terminate running jobs");
            }

            self.tick();

            if self.executor.is_draining() && self.executor.running().is_empty() {
                info!("drain: complete");
                return Ok(RunOutcome::Drained);
            }
            if once && self.executor.queue_len() == 0 && self.executor.running().is_empty() {
                info!(
                    "queue drained: succeeded={} failed={} skipped={}",
                    self.executor.stats().succeeded(),
                    self.executor.stats().failed(),
                    self.executor.stats().skipped()
                );
                return Ok(RunOutcome::Completed);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.check_interval()) => {}
                _ = control.wait() => debug!("woken by signal"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::marker_path;
    use crate::queue::SidecarOracle;
    use crate::stats::load_snapshot;
    use crate::testing::{FakeConverter, FakeOutcome, FakeProbe, FakeProcessTable};
    use std::fs;
    use std::path::Path;

    fn config(dir: &Path, state: &Path) -> SchedulerConfig {
        SchedulerConfig {
            target_directories: vec![dir.to_path_buf()],
            state_dir: state.to_path_buf(),
            max_parallel_jobs: 2,
            check_interval: 1,
            hostname: Some("host-a".to_string()),
            ..Default::default()
        }
    }

    fn coordinator(cfg: SchedulerConfig, probe: FakeProbe, conv: FakeConverter) -> Coordinator {
        Coordinator::with_locks(
            cfg,
            Collaborators {
                probe: Box::new(probe),
                processes: Box::new(FakeProcessTable::default()),
                converter: Box::new(conv),
                oracle: Box::new(SidecarOracle),
            },
            LockManager::new("host-a", 4242, Duration::from_secs(1800)),
        )
    }

    fn files(dir: &Path, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let p = dir.join(format!("ep{i:02}.mkv"));
                fs::write(&p, vec![0u8; 10 + i]).unwrap();
                p
            })
            .collect()
    }

    #[test]
    fn test_tick_publishes_snapshot() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        files(media.path(), 3);
        let cfg = config(media.path(), state.path());
        let mut c = coordinator(cfg.clone(), FakeProbe::idle(), FakeConverter::new(FakeOutcome::Succeed { after_polls: 5 }));
        c.boot();
        let report = c.tick();
        assert_eq!(report.started.len(), 2);

        let snap = load_snapshot(&cfg.stats_path()).unwrap();
        assert_eq!(snap.hostname, "host-a");
        assert_eq!(snap.counts.active, 2);
        assert_eq!(snap.counts.queued, 1);
        assert_eq!(snap.target_jobs, 2);
        assert!(snap.last_sample.is_some());
    }

    fn backdate_queue_build(c: &mut Coordinator, secs: u64) {
        c.last_queue_build = Instant::now().checked_sub(Duration::from_secs(secs));
    }

    #[test]
    fn test_dry_queue_is_rescanned_in_daemon_mode() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        files(media.path(), 1);
        let conv = FakeConverter::new(FakeOutcome::Succeed { after_polls: 0 });
        let mut c = coordinator(config(media.path(), state.path()), FakeProbe::idle(), conv.clone());
        c.boot();
        assert_eq!(c.tick().started.len(), 1);
        let drained = c.tick();
        assert_eq!((drained.finished.len(), drained.queued, drained.active), (1, 0, 0));

        let late = media.path().join("late.mkv");
        fs::write(&late, vec![3u8; 64]).unwrap();
        // Rescans of a dry queue are spaced by the check interval
        backdate_queue_build(&mut c, 0);
        assert!(c.tick().started.is_empty());

        backdate_queue_build(&mut c, 2);
        let report = c.tick();
        assert_eq!(report.started, vec![late.clone()]);
        assert_eq!(conv.spawned().len(), 2);
    }

    #[test]
    fn test_dry_queue_is_not_rescanned_with_once() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let mut c = coordinator(
            config(media.path(), state.path()),
            FakeProbe::idle(),
            FakeConverter::new(FakeOutcome::Succeed { after_polls: 0 }),
        );
        c.daemon = false;
        c.boot();
        fs::write(media.path().join("late.mkv"), vec![3u8; 64]).unwrap();
        backdate_queue_build(&mut c, 2);
        assert!(c.tick().started.is_empty());
    }

    #[test]
    fn test_invalid_reload_keeps_previous_config() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let cfg = config(media.path(), state.path());
        let mut c = coordinator(cfg.clone(), FakeProbe::idle(), FakeConverter::new(FakeOutcome::SucceedWithoutOutput));

        let bad = SchedulerConfig {
            min_parallel_jobs: 5,
            max_parallel_jobs: 1,
            ..cfg.clone()
        };
        assert!(c.reload(bad).is_err());
        assert_eq!(c.config(), &cfg);

        let good = SchedulerConfig {
            max_parallel_jobs: 6,
            ..cfg.clone()
        };
        c.reload(good).unwrap();
        assert_eq!(c.config().max_parallel_jobs, 6);
    }

    #[test]
    fn test_reload_from_disk_rejects_broken_file() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let cfg = config(media.path(), state.path());
        let path = state.path().join("convd.toml");
        fs::write(&path, "max_parallel_jobs = \"lots\"").unwrap();

        let mut c = coordinator(cfg.clone(), FakeProbe::idle(), FakeConverter::new(FakeOutcome::SucceedWithoutOutput));
        c.set_config_path(Some(path));
        c.reload_from_disk();
        assert_eq!(c.config(), &cfg);
    }

    #[tokio::test]
    async fn test_run_once_completes_queue() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let paths = files(media.path(), 3);
        let conv = FakeConverter::new(FakeOutcome::Succeed { after_polls: 0 });
        let mut c = coordinator(config(media.path(), state.path()), FakeProbe::idle(), conv.clone());
        c.boot();

        let outcome = c.run(&Control::new(), true).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(conv.spawned().len(), 3);
        assert_eq!(c.executor().stats().succeeded(), 3);
        for p in paths {
            assert_eq!(fs::read(&p).unwrap(), b"converted");
        }
    }

    #[tokio::test]
    async fn test_first_stop_drains() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        files(media.path(), 4);
        let conv = FakeConverter::new(FakeOutcome::Succeed { after_polls: 0 });
        let mut c = coordinator(config(media.path(), state.path()), FakeProbe::idle(), conv.clone());
        c.boot();
        c.tick();

        let control = Control::new();
        assert_eq!(control.request_stop(), 1);
        assert_eq!(c.run(&control, false).await.unwrap(), RunOutcome::Drained);
        assert_eq!(conv.spawned().len(), 2);
        assert_eq!(c.executor().queue_len(), 2);
        assert_eq!(c.executor().stats().succeeded(), 2);
    }

    #[tokio::test]
    async fn test_second_stop_terminates() {
        let media = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let paths = files(media.path(), 2);
        let conv = FakeConverter::new(FakeOutcome::RunUntilKilled);
        let mut c = coordinator(config(media.path(), state.path()), FakeProbe::idle(), conv.clone());
        c.boot();
        c.tick();

        let control = Control::new();
        control.request_stop();
        control.request_stop();
        assert_eq!(c.run(&control, false).await.unwrap(), RunOutcome::Terminated);
        assert_eq!(conv.killed(), 2);
        for p in paths {
            assert!(!marker_path(&p).unwrap().exists());
        }
    }
}
