//! Error types for the conversion scheduler
//!
//! Only configuration and startup failures are fatal. Everything that can go
//! wrong for a single candidate or a single sample has its own type so the
//! caller can absorb it, log it with context and keep the loop running.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration problems, detected before the control loop starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse JSON config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no valid target directories (checked: {0:?})")]
    NoTargetDirectories(Vec<PathBuf>),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// A single resource metric could not be read.
///
/// The monitor absorbs these by reusing the previous value.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("resource unavailable: {metric}: {reason}")]
    ResourceUnavailable { metric: &'static str, reason: String },
}

/// Failures of the lock-marker protocol itself.
///
/// Losing a race is not an error, see [`crate::lock::Acquire::AlreadyLocked`].
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock marker I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode lock record for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("media path has no file name: {0}")]
    NoFileName(PathBuf),
}

/// Errors raised by the job executor for one slot.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("slot {slot} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        slot: String,
        from: crate::executor::SlotStatus,
        to: crate::executor::SlotStatus,
    },

    #[error("failed to spawn conversion for {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("conversion of {path} failed: {reason}")]
    ConversionFailure { path: PathBuf, reason: String },

    #[error(transparent)]
    Lock(#[from] LockError),
}
