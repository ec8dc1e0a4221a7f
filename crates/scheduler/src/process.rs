//! Structured process snapshots and the predicates evaluated over them.
//!
//! Process listing sits behind [`ProcessTable`] so that priority detection,
//! pid liveness checks and adoption of externally started conversions can be
//! tested against a fixed table.

use std::collections::HashSet;
use std::ffi::OsStr;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::config::SchedulerConfig;

/// Media-server transcoder processes
pub const MEDIA_SERVER_PATTERNS: &[&str] = &["plex transcoder", "plex media scanner", "jellyfin-ffmpeg"];

/// Download clients and import/automation scripts
pub const DOWNLOAD_PATTERNS: &[&str] = &[
    "sabnzbd",
    "nzbget",
    "qbittorrent",
    "transmission-daemon",
    "deluged",
    "rtorrent",
    "unpackerr",
];

/// One live process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: impl Into<String>, cmdline: &[&str]) -> Self {
        Self {
            pid,
            name: name.into(),
            cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Full command line joined by spaces
    pub fn command_line(&self) -> String {
        self.cmdline.join(" ")
    }
}

/// Source of live-process snapshots
pub trait ProcessTable {
    /// List all live processes, one entry per process.
    ///
    /// Threads are not processes here: an implementation whose platform
    /// reports threads as separate tasks (sysinfo on Linux) drops them, so a
    /// multithreaded encoder is seen once.
    fn list(&mut self) -> std::io::Result<Vec<ProcessInfo>>;

    /// Whether a process with this pid is alive on this host
    fn is_alive(&mut self, pid: u32) -> bool {
        match self.list() {
            Ok(procs) => procs.iter().any(|p| p.pid == pid),
            // Unknown liveness counts as alive so a lock is never stolen on a failed read
            Err(_) => true,
        }
    }
}

/// [`ProcessTable`] backed by `sysinfo`
pub struct SysinfoProcessTable {
    system: System,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self { system: System::new() }
    }

    fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
        );
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn list(&mut self) -> std::io::Result<Vec<ProcessInfo>> {
        self.refresh();
        Ok(self
            .system
            .processes()
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: lossy(process.name()),
                cmdline: process.cmd().iter().map(lossy).collect(),
            })
            .collect())
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        let target = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            ProcessRefreshKind::new(),
        );
        self.system.process(target).is_some()
    }
}

fn lossy<S: AsRef<OsStr> + ?Sized>(s: &S) -> String {
    s.as_ref().to_string_lossy().into_owned()
}

/// Case-insensitive substring pattern over a process name or its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPattern(String);

impl ProcessPattern {
    pub fn new(pattern: &str) -> Self {
        Self(pattern.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, process: &ProcessInfo) -> bool {
        if self.0.is_empty() {
            return false;
        }
        process.name.to_lowercase().contains(&self.0)
            || process.cmdline.iter().any(|arg| arg.to_lowercase().contains(&self.0))
    }
}

/// Decides whether a latency-sensitive process is running.
#[derive(Debug, Clone, Default)]
pub struct PriorityMatcher {
    patterns: Vec<ProcessPattern>,
    ignored_pids: HashSet<u32>,
}

impl PriorityMatcher {
    pub fn new(patterns: impl IntoIterator<Item = ProcessPattern>) -> Self {
        Self {
            patterns: patterns.into_iter().collect(),
            ignored_pids: HashSet::from([std::process::id()]),
        }
    }

    /// Pattern set enabled by the configuration
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        let mut patterns = Vec::new();
        if cfg.plex_priority {
            patterns.extend(MEDIA_SERVER_PATTERNS.iter().map(|p| ProcessPattern::new(p)));
        }
        if cfg.download_priority {
            patterns.extend(DOWNLOAD_PATTERNS.iter().map(|p| ProcessPattern::new(p)));
        }
        patterns.extend(cfg.pause_for_processes.iter().map(|p| ProcessPattern::new(p)));
        Self::new(patterns)
    }

    pub fn patterns(&self) -> &[ProcessPattern] {
        &self.patterns
    }

    /// First live process matching any pattern, ignoring our own pid
    pub fn find<'a>(&self, processes: &'a [ProcessInfo]) -> Option<&'a ProcessInfo> {
        processes
            .iter()
            .filter(|p| !self.ignored_pids.contains(&p.pid))
            .find(|p| self.patterns.iter().any(|pat| pat.matches(p)))
    }

    pub fn is_active(&self, processes: &[ProcessInfo]) -> bool {
        self.find(processes).is_some()
    }
}

/// Live processes whose command line carries any of the signatures.
///
/// Entries sharing one command line are the same conversion seen more than
/// once (threads, or a wrapper and its child); only the lowest pid is kept.
pub fn matching_signatures<'a>(
    processes: &'a [ProcessInfo],
    signatures: &[String],
) -> Vec<&'a ProcessInfo> {
    let own_pid = std::process::id();
    let mut found: Vec<&ProcessInfo> = processes
        .iter()
        .filter(|p| p.pid != own_pid)
        .filter(|p| {
            let line = p.command_line();
            signatures.iter().any(|sig| !sig.is_empty() && line.contains(sig.as_str()))
        })
        .collect();
    found.sort_by_key(|p| p.pid);
    let mut seen = HashSet::new();
    found.retain(|p| seen.insert(p.command_line()));
    found
}
