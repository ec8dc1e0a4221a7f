//! Deterministic stand-ins for the system seams.
//!
//! Compiled for unit tests and, behind the `testing` feature, for the scenario
//! tests under `tests/`. Every fake is
//! cheap to clone and clones share state, so a test keeps a handle and
//! drives the fake after it has been boxed into the coordinator.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::convert::{ConversionProcess, Converter, ExitOutcome};
use crate::error::MonitorError;
use crate::monitor::{MemoryReading, SystemProbe};
use crate::process::{ProcessInfo, ProcessTable};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct ProbeState {
    cpu: f64,
    total: u64,
    available: u64,
    load: f64,
    zfs: u64,
    failing: bool,
}

/// Scriptable [`SystemProbe`]
#[derive(Debug, Clone)]
pub struct FakeProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl FakeProbe {
    pub fn new(cpu: f64, total_bytes: u64, available_bytes: u64, load: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProbeState {
                cpu,
                total: total_bytes,
                available: available_bytes,
                load,
                zfs: 0,
                failing: false,
            })),
        }
    }

    /// Plenty of everything
    pub fn idle() -> Self {
        const GIB: u64 = 1024 * 1024 * 1024;
        Self::new(5.0, 64 * GIB, 48 * GIB, 0.2)
    }

    pub fn set_cpu(&self, cpu: f64) {
        lock(&self.state).cpu = cpu;
    }

    pub fn set_memory(&self, total_bytes: u64, available_bytes: u64) {
        let mut s = lock(&self.state);
        s.total = total_bytes;
        s.available = available_bytes;
    }

    pub fn set_available(&self, available_bytes: u64) {
        lock(&self.state).available = available_bytes;
    }

    pub fn set_load(&self, load: f64) {
        lock(&self.state).load = load;
    }

    pub fn set_zfs_reclaimable(&self, bytes: u64) {
        lock(&self.state).zfs = bytes;
    }

    /// While set, every reading fails
    pub fn fail_next_reads(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }

    fn read<T>(&self, metric: &'static str, f: impl FnOnce(&ProbeState) -> T) -> Result<T, MonitorError> {
        let s = lock(&self.state);
        if s.failing {
            return Err(MonitorError::ResourceUnavailable {
                metric,
                reason: "injected failure".to_string(),
            });
        }
        Ok(f(&s))
    }
}

impl SystemProbe for FakeProbe {
    fn cpu_percent(&mut self) -> Result<f64, MonitorError> {
        self.read("cpu", |s| s.cpu)
    }

    fn memory(&mut self) -> Result<MemoryReading, MonitorError> {
        self.read("memory", |s| MemoryReading {
            total_bytes: s.total,
            available_bytes: s.available,
        })
    }

    fn load_average(&mut self) -> Result<f64, MonitorError> {
        self.read("load average", |s| s.load)
    }

    fn zfs_reclaimable(&mut self) -> Result<u64, MonitorError> {
        self.read("zfs arc", |s| s.zfs)
    }
}

/// Settable [`ProcessTable`]
#[derive(Debug, Clone, Default)]
pub struct FakeProcessTable {
    processes: Arc<Mutex<Vec<ProcessInfo>>>,
}

impl FakeProcessTable {
    pub fn new(processes: Vec<ProcessInfo>) -> Self {
        Self {
            processes: Arc::new(Mutex::new(processes)),
        }
    }

    pub fn set(&self, processes: Vec<ProcessInfo>) {
        *lock(&self.processes) = processes;
    }

    pub fn add(&self, process: ProcessInfo) {
        lock(&self.processes).push(process);
    }

    pub fn remove(&self, pid: u32) {
        lock(&self.processes).retain(|p| p.pid != pid);
    }
}

impl ProcessTable for FakeProcessTable {
    fn list(&mut self) -> io::Result<Vec<ProcessInfo>> {
        Ok(lock(&self.processes).clone())
    }
}

/// How processes started by a [`FakeConverter`] behave
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOutcome {
    /// Writes the output, exits 0 after this many unfinished polls
    Succeed { after_polls: u32 },
    /// Exits 0 without producing an output file
    SucceedWithoutOutput,
    /// Writes a partial output, then fails with `reason`
    Fail { after_polls: u32, reason: String },
    /// Writes a partial output and never exits on its own
    RunUntilKilled,
    /// The spawn itself fails
    SpawnError,
}

#[derive(Debug, Default)]
struct ConverterState {
    spawned: Vec<PathBuf>,
    killed: usize,
    next_pid: u32,
}

/// Scriptable [`Converter`]; clones share their spawn history.
#[derive(Debug, Clone)]
pub struct FakeConverter {
    outcome: Arc<Mutex<FakeOutcome>>,
    state: Arc<Mutex<ConverterState>>,
}

impl FakeConverter {
    pub fn new(outcome: FakeOutcome) -> Self {
        Self {
            outcome: Arc::new(Mutex::new(outcome)),
            state: Arc::new(Mutex::new(ConverterState {
                next_pid: 50_000,
                ..Default::default()
            })),
        }
    }

    /// Build a converter for another instance that shares this one's history
    pub fn sharing_history(&self, outcome: FakeOutcome) -> Self {
        Self {
            outcome: Arc::new(Mutex::new(outcome)),
            state: Arc::clone(&self.state),
        }
    }

    pub fn set_outcome(&self, outcome: FakeOutcome) {
        *lock(&self.outcome) = outcome;
    }

    /// Inputs in spawn order
    pub fn spawned(&self) -> Vec<PathBuf> {
        lock(&self.state).spawned.clone()
    }

    pub fn killed(&self) -> usize {
        lock(&self.state).killed
    }
}

impl Converter for FakeConverter {
    fn spawn(&self, input: &Path, output: &Path) -> io::Result<Box<dyn ConversionProcess>> {
        let outcome = lock(&self.outcome).clone();
        match &outcome {
            FakeOutcome::SpawnError => {
                return Err(io::Error::new(ErrorKind::NotFound, "encoder binary not found"))
            }
            FakeOutcome::Succeed { .. } => fs::write(output, b"converted")?,
            FakeOutcome::Fail { .. } | FakeOutcome::RunUntilKilled => fs::write(output, b"partial")?,
            FakeOutcome::SucceedWithoutOutput => {}
        }
        let pid = {
            let mut s = lock(&self.state);
            s.spawned.push(input.to_path_buf());
            s.next_pid += 1;
            s.next_pid
        };
        Ok(Box::new(FakeProcess {
            pid,
            outcome,
            polls: 0,
            killed: false,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeProcess {
    pid: u32,
    outcome: FakeOutcome,
    polls: u32,
    killed: bool,
    state: Arc<Mutex<ConverterState>>,
}

impl FakeProcess {
    fn poll(&mut self, after: u32) -> bool {
        if self.polls < after {
            self.polls += 1;
            false
        } else {
            true
        }
    }
}

impl ConversionProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        if self.killed {
            return Ok(Some(ExitOutcome::Failed {
                code: None,
                reason: "killed".to_string(),
            }));
        }
        let outcome = match self.outcome.clone() {
            FakeOutcome::Succeed { after_polls } => self.poll(after_polls).then_some(ExitOutcome::Success),
            FakeOutcome::SucceedWithoutOutput => Some(ExitOutcome::Success),
            FakeOutcome::Fail { after_polls, reason } => self
                .poll(after_polls)
                .then(|| ExitOutcome::Failed { code: Some(1), reason }),
            FakeOutcome::RunUntilKilled => None,
            FakeOutcome::SpawnError => Some(ExitOutcome::Failed {
                code: None,
                reason: "never started".to_string(),
            }),
        };
        Ok(outcome)
    }

    fn kill(&mut self) -> io::Result<()> {
        if !self.killed {
            self.killed = true;
            lock(&self.state).killed += 1;
        }
        Ok(())
    }
}
