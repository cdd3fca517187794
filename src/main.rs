use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tunnel_depot::cli::{execute_command, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    debug!("Tunnel Depot v{}", env!("CARGO_PKG_VERSION"));

    execute_command(&cli).await
}
