use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use docsession_core::SessionConfig;

use crate::cli::Cli;

/// Runtime configuration derived from CLI/env.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen_addr: String,
    pub session: SessionConfig,
}

impl DaemonConfig {
    /// Build and validate. Invalid values fail here, before anything binds.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let temp_dir = match &cli.temp_dir {
            Some(dir) if dir.is_relative() && !dir.as_os_str().is_empty() => {
                std::env::current_dir()?.join(dir)
            }
            Some(dir) => dir.clone(),
            None => default_temp_dir(),
        };

        let session = SessionConfig {
            enabled: cli.sessions_enabled,
            disconnect_behavior: cli.disconnect_behavior,
            idle_timeout_minutes: cli.idle_timeout_minutes,
            temp_dir,
            temp_prefix: cli.temp_prefix.clone(),
            max_sessions: cli.max_sessions,
            max_file_size_mb: cli.max_file_size_mb,
            temp_retention_hours: cli.temp_retention_hours,
            isolation_mode: cli.isolation_mode,
            reaper_interval: Duration::from_secs(cli.reaper_interval_secs),
            cleanup_interval: Duration::from_secs(cli.cleanup_interval_secs),
        };
        session
            .validate()
            .context("invalid session configuration")?;

        Ok(Self {
            listen_addr: cli.listen_addr.clone(),
            session,
        })
    }
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("docsession")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use docsession_types::{DisconnectBehavior, IsolationMode};

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["docsession-server"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = DaemonConfig::from_cli(&parse(&[])).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:8797");
        assert!(cfg.session.enabled);
        assert_eq!(cfg.session.max_sessions, 10);
        assert_eq!(cfg.session.idle_timeout_minutes, 30);
        assert_eq!(cfg.session.disconnect_behavior, DisconnectBehavior::SaveToTemp);
        assert_eq!(cfg.session.isolation_mode, IsolationMode::None);
        assert_eq!(cfg.session.temp_prefix, "docsession_");
        assert!(cfg.session.temp_dir.is_absolute());
    }

    #[test]
    fn test_flags_override() {
        let cli = parse(&[
            "--sessions-enabled",
            "false",
            "--disconnect-behavior",
            "prompt-on-reconnect",
            "--isolation-mode",
            "group",
            "--temp-dir",
            "snapshots",
            "--idle-timeout-minutes",
            "0",
        ]);
        let cfg = DaemonConfig::from_cli(&cli).unwrap();
        assert!(!cfg.session.enabled);
        assert_eq!(
            cfg.session.disconnect_behavior,
            DisconnectBehavior::PromptOnReconnect
        );
        assert_eq!(cfg.session.isolation_mode, IsolationMode::Group);
        assert!(cfg.session.temp_dir.is_absolute());
        assert!(cfg.session.temp_dir.ends_with("snapshots"));
        assert_eq!(cfg.session.idle_timeout(), None);
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        let err = DaemonConfig::from_cli(&parse(&["--max-sessions", "0"])).unwrap_err();
        assert!(format!("{err:#}").contains("max_sessions"));

        let err = DaemonConfig::from_cli(&parse(&["--temp-retention-hours", "0"])).unwrap_err();
        assert!(format!("{err:#}").contains("temp_retention_hours"));

        let err = DaemonConfig::from_cli(&parse(&["--temp-prefix", ""])).unwrap_err();
        assert!(format!("{err:#}").contains("temp_prefix"));

        assert!(Cli::try_parse_from(["docsession-server", "--isolation-mode", "tenant"]).is_err());
    }
}
