//! docsession-server: keeps large documents resident across client requests.

use anyhow::Result;
use clap::Parser;
use docsession_server::{cli::Cli, run_with_cli};

#[tokio::main]
async fn main() -> Result<()> {
    run_with_cli(Cli::parse()).await
}
