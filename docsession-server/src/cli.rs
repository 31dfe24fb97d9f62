use std::path::PathBuf;

use clap::{ArgAction, Parser};
use docsession_core::config::DEFAULT_TEMP_PREFIX;
use docsession_types::{DisconnectBehavior, IsolationMode};

/// CLI for the session daemon. Every option can also come from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "docsession-server", about = "Keeps documents resident across client requests")]
pub struct Cli {
    /// Listen address for the HTTP API
    #[arg(long, env = "DOCSESSION_ADDR", default_value = "127.0.0.1:8797")]
    pub listen_addr: String,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Session options
    // ─────────────────────────────────────────────────────────────────────────

    /// Accept new sessions. When false every open is rejected.
    #[arg(long, env = "DOCSESSION_ENABLED", default_value = "true", action = ArgAction::Set)]
    pub sessions_enabled: bool,

    /// Maximum number of concurrently open sessions.
    #[arg(long, env = "DOCSESSION_MAX_SESSIONS", default_value = "10")]
    pub max_sessions: usize,

    /// Minutes of inactivity before a session is evicted (0 = never).
    #[arg(long, env = "DOCSESSION_IDLE_TIMEOUT_MINUTES", default_value = "30")]
    pub idle_timeout_minutes: u64,

    /// Largest file that may be opened, in MB.
    #[arg(long, env = "DOCSESSION_MAX_FILE_SIZE_MB", default_value = "100")]
    pub max_file_size_mb: u64,

    /// What to do with unsaved changes on eviction:
    /// discard, auto-save, save-to-temp or prompt-on-reconnect.
    #[arg(long, env = "DOCSESSION_DISCONNECT_BEHAVIOR", default_value = "save-to-temp")]
    pub disconnect_behavior: DisconnectBehavior,

    /// Ownership checks: none or group.
    #[arg(long, env = "DOCSESSION_ISOLATION_MODE", default_value = "none")]
    pub isolation_mode: IsolationMode,

    /// Seconds between idle sweeps.
    #[arg(long, env = "DOCSESSION_REAPER_INTERVAL_SECS", default_value = "60")]
    pub reaper_interval_secs: u64,

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery options
    // ─────────────────────────────────────────────────────────────────────────

    /// Directory for temp snapshots (defaults to <system temp>/docsession)
    #[arg(long, env = "DOCSESSION_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// File name prefix for temp snapshots.
    #[arg(long, env = "DOCSESSION_TEMP_PREFIX", default_value = DEFAULT_TEMP_PREFIX)]
    pub temp_prefix: String,

    /// Hours a snapshot is kept before cleanup removes it.
    #[arg(long, env = "DOCSESSION_TEMP_RETENTION_HOURS", default_value = "24")]
    pub temp_retention_hours: u64,

    /// Seconds between recovery cleanup sweeps.
    #[arg(long, env = "DOCSESSION_CLEANUP_INTERVAL_SECS", default_value = "3600")]
    pub cleanup_interval_secs: u64,
}
