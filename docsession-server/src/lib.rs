//! Library entrypoint for docsession-server so the daemon can be embedded or
//! driven from tests without spawning the binary.

pub mod cli;
pub mod config;
pub mod identity;
pub mod server;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

/// Install the global subscriber. One that is already installed, by an
/// embedding host or an earlier call, stays in place.
pub fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Run the session daemon using CLI args (parsed by the caller).
pub async fn run_with_cli(cli: cli::Cli) -> Result<()> {
    init_tracing(cli.verbose);

    let cfg = DaemonConfig::from_cli(&cli)?;
    server::serve(cfg).await
}
