//! Dispatches candidates into conversion slots and tracks them to completion.
//!
//! Slots move Pending → Running → {Succeeded, Failed, Skipped}; a Pending
//! slot may also go straight to Skipped or Failed. Terminal states are
//! final. The executor never blocks on a child: exits are found by polling.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::convert::{finalize_output, final_output_path, temp_output_path, ConversionProcess, Converter, ExitOutcome};
use crate::error::ExecutorError;
use crate::lock::{Acquire, LockHandle, LockManager};
use crate::process::ProcessInfo;
use crate::queue::{fingerprint_file, ConversionCandidate, ConversionOracle};
use crate::sidecar;
use crate::stats::Statistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl SlotStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SlotStatus::Succeeded | SlotStatus::Failed | SlotStatus::Skipped)
    }

    pub fn can_transition_to(self, next: SlotStatus) -> bool {
        use SlotStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
        )
    }
}

/// One conversion attempt
pub struct JobSlot {
    pub id: String,
    pub candidate: ConversionCandidate,
    pub status: SlotStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    temp_output: PathBuf,
    process: Option<Box<dyn ConversionProcess>>,
    lock: Option<LockHandle>,
}

impl JobSlot {
    fn new(candidate: ConversionCandidate, temp_output: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            candidate,
            status: SlotStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            temp_output,
            process: None,
            lock: None,
        }
    }

    pub fn transition(&mut self, to: SlotStatus) -> Result<(), ExecutorError> {
        if !self.status.can_transition_to(to) {
            return Err(ExecutorError::InvalidTransition {
                slot: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        match to {
            SlotStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.candidate.path
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }

    fn release_lock(&mut self) {
        if let Some(handle) = self.lock.take() {
            if let Err(e) = handle.release() {
                warn!("release failed slot={} path={}: {}", self.id, self.candidate.path.display(), e);
            }
        }
    }
}

/// A conversion started outside this coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdoptedProcess {
    pub pid: u32,
    pub command_line: String,
    pub adopted_at: DateTime<Utc>,
}

/// Terminal result of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub slot: String,
    pub path: PathBuf,
    pub status: SlotStatus,
    pub output: Option<PathBuf>,
    pub error: Option<String>,
}

pub struct JobExecutor {
    locks: LockManager,
    converter: Box<dyn Converter>,
    oracle: Box<dyn ConversionOracle>,
    output_extension: String,
    queue: VecDeque<ConversionCandidate>,
    running: Vec<JobSlot>,
    adopted: Vec<AdoptedProcess>,
    failed_this_run: HashSet<PathBuf>,
    draining: bool,
    stats: Statistics,
}

impl JobExecutor {
    pub fn new(
        locks: LockManager,
        converter: Box<dyn Converter>,
        oracle: Box<dyn ConversionOracle>,
        output_extension: &str,
        stats: Statistics,
    ) -> Self {
        Self {
            locks,
            converter,
            oracle,
            output_extension: output_extension.to_string(),
            queue: VecDeque::new(),
            running: Vec::new(),
            adopted: Vec::new(),
            failed_this_run: HashSet::new(),
            draining: false,
            stats,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn locks_mut(&mut self) -> &mut LockManager {
        &mut self.locks
    }

    pub fn oracle(&self) -> &dyn ConversionOracle {
        self.oracle.as_ref()
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut Statistics {
        &mut self.stats
    }

    /// Replace the remaining queue with a freshly built one
    pub fn replace_queue(&mut self, queue: VecDeque<ConversionCandidate>) {
        let failed = &self.failed_this_run;
        self.queue = queue.into_iter().filter(|c| !failed.contains(&c.path)).collect();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Running own jobs plus adopted external ones
    pub fn active_count(&self) -> usize {
        self.running.len() + self.adopted.len()
    }

    pub fn running(&self) -> &[JobSlot] {
        &self.running
    }

    pub fn adopted(&self) -> &[AdoptedProcess] {
        &self.adopted
    }

    /// Paths a queue rebuild must leave out
    pub fn excluded_paths(&self) -> HashSet<PathBuf> {
        self.running
            .iter()
            .map(|s| s.candidate.path.clone())
            .chain(self.failed_this_run.iter().cloned())
            .collect()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Stop dispatching; running jobs continue to completion
    pub fn begin_drain(&mut self) {
        if !self.draining {
            info!("drain: no new dispatch, waiting for {} running job(s)", self.running.len());
        }
        self.draining = true;
    }

    /// Track externally started conversions against the budget
    pub fn adopt(&mut self, processes: Vec<AdoptedProcess>) {
        for p in processes {
            if self.adopted.iter().any(|a| a.pid == p.pid) {
                continue;
            }
            info!("adopt: pid={} cmd={:?}", p.pid, p.command_line);
            self.adopted.push(p);
        }
    }

    /// Drop adopted processes that are no longer alive
    pub fn reap_adopted(&mut self, live: &[ProcessInfo]) {
        self.adopted.retain(|a| {
            let alive = live.iter().any(|p| p.pid == a.pid);
            if !alive {
                info!("adopt: pid={} finished, capacity freed", a.pid);
            }
            alive
        });
    }

    /// Start new jobs until `target` is reached or the queue runs dry.
    pub fn dispatch(&mut self, target: usize) -> Vec<PathBuf> {
        let mut started = Vec::new();
        if self.draining {
            return started;
        }
        while self.active_count() < target {
            let Some(candidate) = self.queue.pop_front() else {
                break;
            };
            let temp = temp_output_path(&candidate.path, &self.output_extension);
            let mut slot = JobSlot::new(candidate, temp);
            match self.start(&mut slot) {
                Ok(true) => {
                    started.push(slot.candidate.path.clone());
                    self.running.push(slot);
                }
                Ok(false) => {}
                Err(e) => error!("dispatch: slot={} {}", slot.id, e),
            }
        }
        started
    }

    /// Take the lock, re-check the file and spawn; `Ok(false)` means the slot ended.
    fn start(&mut self, slot: &mut JobSlot) -> Result<bool, ExecutorError> {
        let path = slot.candidate.path.clone();

        match self.locks.acquire(&path) {
            Ok(Acquire::Acquired(handle)) => slot.lock = Some(handle),
            Ok(Acquire::AlreadyLocked(holder)) => {
                let owner = holder
                    .record
                    .map(|r| format!("{}:{}", r.hostname, r.pid))
                    .unwrap_or_else(|| "unknown".to_string());
                self.skip(slot, &format!("locked by {owner}"))?;
                return Ok(false);
            }
            Err(e) => {
                self.skip(slot, &format!("lock error: {e}"))?;
                return Ok(false);
            }
        }

        // Another instance may have finished this file since our scan
        match fingerprint_file(&path) {
            Ok(fp) if fp == slot.candidate.fingerprint => {}
            Ok(_) => {
                self.skip(slot, "changed since scan")?;
                return Ok(false);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.skip(slot, "file disappeared before dispatch")?;
                return Ok(false);
            }
            Err(e) => {
                self.skip(slot, &format!("cannot stat: {e}"))?;
                return Ok(false);
            }
        }
        match self.oracle.needs_conversion(&slot.candidate) {
            Ok(true) => {}
            Ok(false) => {
                self.skip(slot, "already converted")?;
                return Ok(false);
            }
            Err(e) => {
                self.skip(slot, &format!("oracle error: {e:#}"))?;
                return Ok(false);
            }
        }

        // Leftover from a killed attempt; we hold the lock so it is ours to remove
        remove_if_exists(&slot.temp_output);

        match self.converter.spawn(&path, &slot.temp_output) {
            Ok(process) => {
                slot.process = Some(process);
                slot.transition(SlotStatus::Running)?;
                info!(
                    "dispatch: slot={} pid={:?} path={} size={}",
                    slot.id,
                    slot.pid(),
                    path.display(),
                    format_size(slot.candidate.size, DECIMAL)
                );
                Ok(true)
            }
            Err(source) => {
                let err = ExecutorError::Spawn {
                    path: path.clone(),
                    source,
                };
                self.fail(slot, &err.to_string())?;
                Ok(false)
            }
        }
    }

    fn skip(&mut self, slot: &mut JobSlot, reason: &str) -> Result<(), ExecutorError> {
        slot.release_lock();
        slot.transition(SlotStatus::Skipped)?;
        slot.error = Some(reason.to_string());
        self.stats.record_skip();
        info!("skip: slot={} path={} reason={:?}", slot.id, slot.candidate.path.display(), reason);
        Ok(())
    }

    fn fail(&mut self, slot: &mut JobSlot, reason: &str) -> Result<(), ExecutorError> {
        remove_if_exists(&slot.temp_output);
        slot.release_lock();
        slot.transition(SlotStatus::Failed)?;
        slot.error = Some(reason.to_string());
        self.failed_this_run.insert(slot.candidate.path.clone());
        self.stats.record_failure(&slot.candidate.path, reason, Utc::now());
        if let Err(e) = sidecar::write_why_txt(&slot.candidate.path, reason) {
            debug!("could not write why.txt: {:#}", e);
        }
        let err = ExecutorError::ConversionFailure {
            path: slot.candidate.path.clone(),
            reason: reason.to_string(),
        };
        warn!("complete: slot={} status=failed {}", slot.id, err);
        Ok(())
    }

    /// Poll every running child once and settle the ones that exited.
    pub fn reap(&mut self) -> Vec<Completion> {
        let mut finished = Vec::new();
        let slots = std::mem::take(&mut self.running);
        for mut slot in slots {
            let polled = match slot.process.as_mut() {
                Some(p) => p.try_wait(),
                None => Ok(Some(ExitOutcome::Failed {
                    code: None,
                    reason: "no process handle".to_string(),
                })),
            };
            let outcome = match polled {
                Ok(None) => {
                    self.running.push(slot);
                    continue;
                }
                Ok(Some(outcome)) => outcome,
                Err(e) => {
                    if let Some(p) = slot.process.as_mut() {
                        let _ = p.kill();
                    }
                    ExitOutcome::Failed {
                        code: None,
                        reason: format!("lost track of process: {e}"),
                    }
                }
            };
            match self.settle(&mut slot, outcome) {
                Ok(completion) => finished.push(completion),
                Err(e) => error!("reap: slot={} {}", slot.id, e),
            }
        }
        finished
    }

    fn settle(&mut self, slot: &mut JobSlot, outcome: ExitOutcome) -> Result<Completion, ExecutorError> {
        let mut output = None;
        match outcome {
            ExitOutcome::Success => match self.install_output(slot) {
                Ok(final_path) => {
                    slot.transition(SlotStatus::Succeeded)?;
                    slot.release_lock();
                    self.stats.record_success(Utc::now());
                    let elapsed = slot
                        .started_at
                        .map(|t| (Utc::now() - t).num_seconds())
                        .unwrap_or_default();
                    info!(
                        "complete: slot={} status=succeeded path={} output={} elapsed={}s",
                        slot.id,
                        slot.candidate.path.display(),
                        final_path.display(),
                        elapsed
                    );
                    output = Some(final_path);
                }
                Err(reason) => self.fail(slot, &reason)?,
            },
            ExitOutcome::Failed { reason, .. } => self.fail(slot, &reason)?,
        }
        Ok(Completion {
            slot: slot.id.clone(),
            path: slot.candidate.path.clone(),
            status: slot.status,
            output,
            error: slot.error.clone(),
        })
    }

    fn install_output(&self, slot: &JobSlot) -> Result<PathBuf, String> {
        let size = match fs::metadata(&slot.temp_output) {
            Ok(m) => m.len(),
            Err(_) => return Err("encoder exited 0 but produced no output".to_string()),
        };
        if size == 0 {
            return Err("encoder produced an empty output".to_string());
        }
        let final_path = finalize_output(&slot.candidate.path, &slot.temp_output, &self.output_extension)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => format!(
                    "refusing to overwrite existing {}",
                    final_output_path(&slot.candidate.path, &self.output_extension).display()
                ),
                _ => format!("failed to move output into place: {e}"),
            })?;
        if let Err(e) = self.oracle.record_converted(&final_path) {
            warn!("could not record conversion of {}: {:#}", final_path.display(), e);
        }
        Ok(final_path)
    }

    /// Kill every running child, clean its temp output and release its lock.
    pub async fn terminate_all(&mut self, grace: Duration) -> Vec<Completion> {
        for slot in &mut self.running {
            if let Some(p) = slot.process.as_mut() {
                info!("terminate: slot={} pid={:?} path={}", slot.id, p.pid(), slot.candidate.path.display());
                if let Err(e) = p.kill() {
                    warn!("terminate: kill failed slot={}: {}", slot.id, e);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let all_exited = self.running.iter_mut().all(|s| match s.process.as_mut() {
                Some(p) => !matches!(p.try_wait(), Ok(None)),
                None => true,
            });
            if all_exited || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut finished = Vec::new();
        for mut slot in std::mem::take(&mut self.running) {
            if let Err(e) = self.fail(&mut slot, "terminated by operator") {
                error!("terminate: slot={} {}", slot.id, e);
            }
            finished.push(Completion {
                slot: slot.id.clone(),
                path: slot.candidate.path.clone(),
                status: slot.status,
                output: None,
                error: slot.error.clone(),
            });
        }
        self.draining = true;
        finished
    }
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed temp output {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove temp output {}: {}", path.display(), e),
    }
}
