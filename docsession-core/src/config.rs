//! Session configuration and startup validation.

use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use docsession_types::{DisconnectBehavior, IsolationMode};
use thiserror::Error;

/// Default idle reaper period. Independent of the idle timeout granularity.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Default period between recovery cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_TEMP_PREFIX: &str = "docsession_";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be at least {min} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
    },

    #[error("temp directory must not be empty")]
    EmptyTempDir,

    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),

    #[error("temp_prefix must be a non-empty file name prefix (got {0:?})")]
    InvalidTempPrefix(String),
}

/// Immutable configuration for the session layer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub enabled: bool,
    pub disconnect_behavior: DisconnectBehavior,
    /// Minutes of inactivity before a session is reaped. 0 disables reaping.
    pub idle_timeout_minutes: u64,
    pub temp_dir: PathBuf,
    /// File name prefix for temp snapshots.
    pub temp_prefix: String,
    pub max_sessions: usize,
    pub max_file_size_mb: u64,
    pub temp_retention_hours: u64,
    pub isolation_mode: IsolationMode,
    pub reaper_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disconnect_behavior: DisconnectBehavior::SaveToTemp,
            idle_timeout_minutes: 30,
            temp_dir: std::env::temp_dir().join("docsession"),
            temp_prefix: DEFAULT_TEMP_PREFIX.to_string(),
            max_sessions: 10,
            max_file_size_mb: 100,
            temp_retention_hours: 24,
            isolation_mode: IsolationMode::None,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl SessionConfig {
    /// Fail fast on values the session layer cannot run with.
    ///
    /// Only checked when sessions are enabled, except for the temp prefix:
    /// recovery cleanup runs either way and deletes by that prefix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_temp_prefix(&self.temp_prefix) {
            return Err(ConfigError::InvalidTempPrefix(self.temp_prefix.clone()));
        }
        if !self.enabled {
            return Ok(());
        }
        if self.max_sessions < 1 {
            return Err(ConfigError::OutOfRange {
                field: "max_sessions",
                value: self.max_sessions as u64,
                min: 1,
            });
        }
        if self.max_file_size_mb < 1 {
            return Err(ConfigError::OutOfRange {
                field: "max_file_size_mb",
                value: self.max_file_size_mb,
                min: 1,
            });
        }
        if self.temp_retention_hours < 1 {
            return Err(ConfigError::OutOfRange {
                field: "temp_retention_hours",
                value: self.temp_retention_hours,
                min: 1,
            });
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyTempDir);
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("reaper_interval"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("cleanup_interval"));
        }
        Ok(())
    }

    /// Idle timeout, or `None` when reaping is disabled.
    pub fn idle_timeout(&self) -> Option<TimeDelta> {
        if self.idle_timeout_minutes == 0 {
            return None;
        }
        let minutes = i64::try_from(self.idle_timeout_minutes).unwrap_or(i64::MAX);
        Some(TimeDelta::try_minutes(minutes).unwrap_or(TimeDelta::MAX))
    }

    pub fn retention(&self) -> TimeDelta {
        let hours = i64::try_from(self.temp_retention_hours).unwrap_or(i64::MAX);
        TimeDelta::try_hours(hours).unwrap_or(TimeDelta::MAX)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

/// A prefix must be non-empty and name a file, not a path.
pub fn is_valid_temp_prefix(prefix: &str) -> bool {
    !prefix.is_empty() && !prefix.chars().any(|c| std::path::is_separator(c) || c == '/' || c == '\\')
}
