use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::QueueOrder;

/// Configuration for the conversion scheduler
///
/// Loaded once at start and replaced only on an explicit reload (SIGHUP).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// CPU usage (percent of all cores) above which concurrency steps down
    pub max_cpu_percent: f64,
    /// Used-memory percentage above which concurrency steps down
    pub max_memory_percent: f64,
    /// 1-minute load average above which concurrency steps down
    pub max_load_average: f64,
    /// Below this much available memory nothing new is dispatched
    pub min_available_memory_gb: f64,
    /// Seconds between control-loop ticks
    pub check_interval: u64,
    /// Upper bound on concurrent conversions on this host
    pub max_parallel_jobs: usize,
    /// Lower bound on concurrent conversions while only resource thresholds are exceeded
    pub min_parallel_jobs: usize,
    /// Yield to media-server transcodes
    pub plex_priority: bool,
    /// Yield to download clients and import scripts
    pub download_priority: bool,
    /// Count reclaimable ZFS ARC as available memory
    pub zfs_aware: bool,
    /// Library roots to scan for media files
    pub target_directories: Vec<PathBuf>,
    /// Extra process name/command-line patterns that should reduce concurrency
    pub pause_for_processes: Vec<String>,
    /// Media file suffixes to consider, without the dot
    pub video_extensions: Vec<String>,

    /// Seconds after which a lock marker may be reclaimed by anyone
    pub lock_ttl_secs: u64,
    /// Order in which candidates are dispatched
    pub queue_order: QueueOrder,
    /// Seconds between explicit queue rebuilds
    pub queue_refresh_interval_secs: u64,
    /// Consecutive favorable samples required before concurrency goes up
    pub scale_up_samples: u32,
    /// Directory holding the statistics snapshot
    pub state_dir: PathBuf,
    /// Encoder argv; `{input}` and `{output}` are substituted per job
    pub encoder_command: Vec<String>,
    /// Container extension of converted files
    pub output_extension: String,
    /// Command-line fragments identifying conversions started outside this process
    pub adopt_signatures: Vec<String>,
    /// Files smaller than this are never candidates
    pub min_file_bytes: u64,
    /// Sliding window used for the throughput estimate, in seconds
    pub throughput_window_secs: u64,
    /// Overrides the detected hostname in lock markers
    pub hostname: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl SchedulerConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            max_cpu_percent: 85.0,
            max_memory_percent: 85.0,
            max_load_average: 8.0,
            min_available_memory_gb: 2.0,
            check_interval: 30,
            max_parallel_jobs: 2,
            min_parallel_jobs: 1,
            plex_priority: true,
            download_priority: true,
            zfs_aware: false,
            target_directories: vec![PathBuf::from("/media")],
            pause_for_processes: Vec::new(),
            video_extensions: ["mkv", "mp4", "m4v", "avi", "mov", "webm"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            lock_ttl_secs: 30 * 60,
            queue_order: QueueOrder::SmallestFirst,
            queue_refresh_interval_secs: 60 * 60,
            scale_up_samples: 3,
            state_dir: PathBuf::from("/tmp/convd-state"),
            encoder_command: [
                "ffmpeg", "-hide_banner", "-nostdin", "-y", "-i", "{input}", "-map", "0",
                "-c:v", "libsvtav1", "-crf", "30", "-preset", "8", "-c:a", "copy", "-c:s",
                "copy", "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            output_extension: "mkv".to_string(),
            adopt_signatures: vec![".tmp.av1.".to_string()],
            min_file_bytes: 0,
            throughput_window_secs: 60 * 60,
            hostname: None,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    ///
    /// The returned configuration has been validated.
    pub fn load_config(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                    path: config_path.to_path_buf(),
                    source,
                })?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content).map_err(|source| ConfigError::Toml {
                        path: config_path.to_path_buf(),
                        source,
                    })?;
                } else {
                    config = serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                        path: config_path.to_path_buf(),
                        source,
                    })?;
                }
            } else {
                warn!("Config file {} not found, using defaults", config_path.display());
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_jobs == 0 {
            return Err(invalid("max_parallel_jobs", "must be at least 1"));
        }
        if self.min_parallel_jobs > self.max_parallel_jobs {
            return Err(invalid(
                "min_parallel_jobs",
                format!(
                    "{} exceeds max_parallel_jobs {}",
                    self.min_parallel_jobs, self.max_parallel_jobs
                ),
            ));
        }
        if self.check_interval == 0 {
            return Err(invalid("check_interval", "must be at least 1 second"));
        }
        if self.lock_ttl_secs == 0 {
            return Err(invalid("lock_ttl_secs", "must be at least 1 second"));
        }
        if self.scale_up_samples == 0 {
            return Err(invalid("scale_up_samples", "must be at least 1"));
        }
        for (key, value) in [
            ("max_cpu_percent", self.max_cpu_percent),
            ("max_memory_percent", self.max_memory_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(invalid(key, format!("{value} is not within (0, 100]")));
            }
        }
        if !(self.max_load_average > 0.0) {
            return Err(invalid("max_load_average", "must be positive"));
        }
        if !(self.min_available_memory_gb >= 0.0) {
            return Err(invalid("min_available_memory_gb", "must not be negative"));
        }
        if self.video_extensions.is_empty() {
            return Err(invalid("video_extensions", "must list at least one suffix"));
        }
        if self.output_extension.is_empty() || self.output_extension.contains('.') {
            return Err(invalid("output_extension", "must be a bare extension like \"mkv\""));
        }
        match self.encoder_command.first() {
            None => return Err(invalid("encoder_command", "must not be empty")),
            Some(_) => {
                let has_input = self.encoder_command.iter().any(|a| a.contains("{input}"));
                let has_output = self.encoder_command.iter().any(|a| a.contains("{output}"));
                if !has_input || !has_output {
                    return Err(invalid(
                        "encoder_command",
                        "must contain both {input} and {output} placeholders",
                    ));
                }
            }
        }

        let valid_roots = self.valid_target_directories();
        if valid_roots.is_empty() {
            return Err(ConfigError::NoTargetDirectories(self.target_directories.clone()));
        }
        for root in &self.target_directories {
            if !root.is_dir() {
                warn!("Target directory does not exist or is not a directory: {}", root.display());
            }
        }
        Ok(())
    }

    /// Target directories that exist right now
    pub fn valid_target_directories(&self) -> Vec<PathBuf> {
        self.target_directories
            .iter()
            .filter(|p| p.is_absolute() && p.is_dir())
            .cloned()
            .collect()
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn queue_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.queue_refresh_interval_secs)
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_secs(self.throughput_window_secs)
    }

    /// Minimum available memory in bytes
    pub fn min_available_memory_bytes(&self) -> u64 {
        (self.min_available_memory_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }

    /// Path of the statistics snapshot read by external monitors
    pub fn stats_path(&self) -> PathBuf {
        self.state_dir.join("stats.json")
    }

    /// Lower-cased extension list for matching
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.video_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect()
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}
