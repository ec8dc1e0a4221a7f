//! Resource sampling
//!
//! One [`ResourceSample`] is produced per tick. A failed reading never aborts
//! the scheduler: the previous good value is reused and a warning is logged.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use humansize::{format_size, BINARY};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::config::SchedulerConfig;
use crate::error::MonitorError;
use crate::process::{PriorityMatcher, ProcessInfo, ProcessTable};

const ARCSTATS_PATH: &str = "/proc/spl/kstat/zfs/arcstats";

/// Point-in-time view of the machine. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    /// Memory the OS can hand out without swapping (cache-aware)
    pub available_memory_bytes: u64,
    pub total_memory_bytes: u64,
    pub load_average_1m: f64,
    pub priority_process_active: bool,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSample {
    /// Percentage of memory in use, derived from the available figure
    pub fn memory_percent(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 100.0;
        }
        let used = self.total_memory_bytes.saturating_sub(self.available_memory_bytes);
        used as f64 / self.total_memory_bytes as f64 * 100.0
    }
}

/// Raw memory reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Source of raw system metrics
pub trait SystemProbe {
    fn cpu_percent(&mut self) -> Result<f64, MonitorError>;
    fn memory(&mut self) -> Result<MemoryReading, MonitorError>;
    fn load_average(&mut self) -> Result<f64, MonitorError>;
    /// Reclaimable ZFS ARC bytes; zero when ZFS is absent
    fn zfs_reclaimable(&mut self) -> Result<u64, MonitorError>;
}

/// [`SystemProbe`] backed by `sysinfo` and procfs
pub struct SysinfoProbe {
    system: System,
    arcstats: PathBuf,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU counters so the first real sample has a baseline
        system.refresh_cpu_usage();
        Self {
            system,
            arcstats: PathBuf::from(ARCSTATS_PATH),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn cpu_percent(&mut self) -> Result<f64, MonitorError> {
        self.system.refresh_cpu_usage();
        if self.system.cpus().is_empty() {
            return Err(MonitorError::ResourceUnavailable {
                metric: "cpu",
                reason: "no CPUs reported".to_string(),
            });
        }
        Ok(self.system.global_cpu_usage() as f64)
    }

    fn memory(&mut self) -> Result<MemoryReading, MonitorError> {
        self.system.refresh_memory();
        let total_bytes = self.system.total_memory();
        if total_bytes == 0 {
            return Err(MonitorError::ResourceUnavailable {
                metric: "memory",
                reason: "total memory reported as zero".to_string(),
            });
        }
        Ok(MemoryReading {
            total_bytes,
            available_bytes: self.system.available_memory(),
        })
    }

    fn load_average(&mut self) -> Result<f64, MonitorError> {
        let load = System::load_average().one;
        if !load.is_finite() || load < 0.0 {
            return Err(MonitorError::ResourceUnavailable {
                metric: "load",
                reason: format!("bogus load average {load}"),
            });
        }
        Ok(load)
    }

    fn zfs_reclaimable(&mut self) -> Result<u64, MonitorError> {
        read_arc_reclaimable(&self.arcstats)
    }
}

/// Parse `size - c_min` out of a kstat arcstats file.
pub fn read_arc_reclaimable(path: &Path) -> Result<u64, MonitorError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(MonitorError::ResourceUnavailable {
                metric: "zfs_arc",
                reason: format!("{}: {}", path.display(), e),
            })
        }
    };
    Ok(parse_arc_reclaimable(&content))
}

fn parse_arc_reclaimable(content: &str) -> u64 {
    let mut size = None;
    let mut c_min = None;
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // name type data
        if fields.len() != 3 {
            continue;
        }
        match fields[0] {
            "size" => size = fields[2].parse::<u64>().ok(),
            "c_min" => c_min = fields[2].parse::<u64>().ok(),
            _ => {}
        }
    }
    match (size, c_min) {
        (Some(size), Some(c_min)) => size.saturating_sub(c_min),
        _ => 0,
    }
}

/// Produces resource samples, degrading to the last known-good values.
pub struct ResourceMonitor {
    probe: Box<dyn SystemProbe>,
    processes: Box<dyn ProcessTable>,
    matcher: PriorityMatcher,
    zfs_aware: bool,
    last_cpu: Option<f64>,
    last_memory: Option<MemoryReading>,
    last_load: Option<f64>,
    last_zfs: u64,
    last_processes: Vec<ProcessInfo>,
    last_sample: Option<ResourceSample>,
}

impl ResourceMonitor {
    pub fn new(
        probe: Box<dyn SystemProbe>,
        processes: Box<dyn ProcessTable>,
        cfg: &SchedulerConfig,
    ) -> Self {
        Self {
            probe,
            processes,
            matcher: PriorityMatcher::from_config(cfg),
            zfs_aware: cfg.zfs_aware,
            last_cpu: None,
            last_memory: None,
            last_load: None,
            last_zfs: 0,
            last_processes: Vec::new(),
            last_sample: None,
        }
    }

    /// Apply a reloaded configuration
    pub fn reconfigure(&mut self, cfg: &SchedulerConfig) {
        self.matcher = PriorityMatcher::from_config(cfg);
        self.zfs_aware = cfg.zfs_aware;
    }

    /// Take one sample.
    pub fn sample(&mut self) -> ResourceSample {
        let cpu_percent = match self.probe.cpu_percent() {
            Ok(v) => {
                self.last_cpu = Some(v);
                v
            }
            Err(e) => fallback(&e, self.last_cpu, 0.0),
        };

        let memory = match self.probe.memory() {
            Ok(m) => {
                self.last_memory = Some(m);
                m
            }
            // Unknown memory on the first sample must not look like plenty
            Err(e) => fallback(
                &e,
                self.last_memory,
                MemoryReading {
                    total_bytes: 0,
                    available_bytes: 0,
                },
            ),
        };

        let load_average_1m = match self.probe.load_average() {
            Ok(v) => {
                self.last_load = Some(v);
                v
            }
            Err(e) => fallback(&e, self.last_load, 0.0),
        };

        let mut available_memory_bytes = memory.available_bytes;
        if self.zfs_aware {
            let arc = match self.probe.zfs_reclaimable() {
                Ok(v) => {
                    self.last_zfs = v;
                    v
                }
                Err(e) => fallback(&e, Some(self.last_zfs), 0),
            };
            if arc > 0 {
                debug!("Counting {} of reclaimable ZFS ARC as available", format_size(arc, BINARY));
            }
            available_memory_bytes = available_memory_bytes
                .saturating_add(arc)
                .min(memory.total_bytes.max(available_memory_bytes));
        }

        match self.processes.list() {
            Ok(procs) => self.last_processes = procs,
            Err(e) => warn!(
                "resource unavailable: processes: {} (reusing previous snapshot of {} processes)",
                e,
                self.last_processes.len()
            ),
        }
        let priority = self.matcher.find(&self.last_processes);
        if let Some(p) = priority {
            debug!("Priority process active: pid={} name={:?}", p.pid, p.name);
        }

        let sample = ResourceSample {
            cpu_percent,
            available_memory_bytes,
            total_memory_bytes: memory.total_bytes,
            load_average_1m,
            priority_process_active: priority.is_some(),
            taken_at: Utc::now(),
        };
        self.last_sample = Some(sample.clone());
        sample
    }

    /// Process snapshot taken with the most recent sample
    pub fn last_processes(&self) -> &[ProcessInfo] {
        &self.last_processes
    }

    pub fn last_sample(&self) -> Option<&ResourceSample> {
        self.last_sample.as_ref()
    }

    /// Process table used for liveness checks outside of sampling
    pub fn process_table(&mut self) -> &mut dyn ProcessTable {
        self.processes.as_mut()
    }
}

fn fallback<T: Copy + std::fmt::Debug>(err: &MonitorError, last: Option<T>, default: T) -> T {
    match last {
        Some(v) => {
            warn!("{} (reusing last known value {:?})", err, v);
            v
        }
        None => {
            warn!("{} (no previous value, using {:?})", err, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProbe, FakeProcessTable};
    use crate::process::ProcessInfo;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn monitor(probe: FakeProbe, procs: FakeProcessTable, cfg: &SchedulerConfig) -> ResourceMonitor {
        ResourceMonitor::new(Box::new(probe), Box::new(procs), cfg)
    }

    #[test]
    fn test_sample_reads_probe() {
        let probe = FakeProbe::new(37.5, 16 * GIB, 6 * GIB, 1.25);
        let mut mon = monitor(probe, FakeProcessTable::default(), &SchedulerConfig::default());
        let s = mon.sample();
        assert_eq!(s.cpu_percent, 37.5);
        assert_eq!(s.available_memory_bytes, 6 * GIB);
        assert_eq!(s.load_average_1m, 1.25);
        assert!(!s.priority_process_active);
        assert!((s.memory_percent() - 62.5).abs() < 1e-9);
    }

    #[test]
    fn test_failed_reading_reuses_last_good_value() {
        let probe = FakeProbe::new(20.0, 16 * GIB, 8 * GIB, 2.0);
        let handle = probe.clone();
        let mut mon = monitor(probe, FakeProcessTable::default(), &SchedulerConfig::default());
        mon.sample();

        handle.set_cpu(90.0);
        handle.fail_next_reads(true);
        let s = mon.sample();
        assert_eq!(s.cpu_percent, 20.0);
        assert_eq!(s.available_memory_bytes, 8 * GIB);
        assert_eq!(s.load_average_1m, 2.0);

        handle.fail_next_reads(false);
        assert_eq!(mon.sample().cpu_percent, 90.0);
    }

    #[test]
    fn test_failed_first_memory_reading_reports_nothing_available() {
        let probe = FakeProbe::new(20.0, 16 * GIB, 8 * GIB, 2.0);
        probe.fail_next_reads(true);
        let mut mon = monitor(probe, FakeProcessTable::default(), &SchedulerConfig::default());
        let s = mon.sample();
        assert_eq!(s.available_memory_bytes, 0);
    }

    #[test]
    fn test_priority_process_detected() {
        let procs = FakeProcessTable::new(vec![ProcessInfo::new(
            99,
            "Plex Transcoder",
            &["Plex Transcoder", "-i", "x.mkv"],
        )]);
        let probe = FakeProbe::new(10.0, 16 * GIB, 8 * GIB, 0.5);
        let mut mon = monitor(probe, procs, &SchedulerConfig::default());
        assert!(mon.sample().priority_process_active);

        let cfg = SchedulerConfig {
            plex_priority: false,
            ..Default::default()
        };
        mon.reconfigure(&cfg);
        assert!(!mon.sample().priority_process_active);
    }

    #[test]
    fn test_zfs_arc_counts_as_available_when_enabled() {
        let probe = FakeProbe::new(10.0, 32 * GIB, 1 * GIB, 0.5);
        probe.set_zfs_reclaimable(4 * GIB);
        let cfg = SchedulerConfig {
            zfs_aware: true,
            ..Default::default()
        };
        let mut mon = monitor(probe.clone(), FakeProcessTable::default(), &cfg);
        assert_eq!(mon.sample().available_memory_bytes, 5 * GIB);

        let mut plain = monitor(probe, FakeProcessTable::default(), &SchedulerConfig::default());
        assert_eq!(plain.sample().available_memory_bytes, 1 * GIB);
    }

    #[test]
    fn test_parse_arcstats() {
        let content = "13 1 0x01 123 33456 1234 5678\n\
                       name                            type data\n\
                       hits                            4    1000\n\
                       size                            4    8589934592\n\
                       c_min                           4    1073741824\n";
        assert_eq!(parse_arc_reclaimable(content), 8589934592 - 1073741824);
        assert_eq!(parse_arc_reclaimable("garbage"), 0);
    }

    #[test]
    fn test_missing_arcstats_is_zero() {
        assert_eq!(
            read_arc_reclaimable(Path::new("/nonexistent/arcstats")).unwrap(),
            0
        );
    }
}
