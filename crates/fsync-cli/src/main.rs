//! fsync: push the files a LAN peer is missing.

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fsync_cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,fsync_core=debug,fsync_cli=debug"
    } else {
        "info,fsync_core=info,fsync_cli=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tokio::select! {
        result = fsync_cli::run(args) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing session");
            bail!("Interrupted");
        }
    }
}
