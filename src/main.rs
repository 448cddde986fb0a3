mod cli;
mod codec;
mod config;
mod diff;
mod editor;
mod extension;
mod frontend;
mod k8s;
mod model;
mod property;
mod state;
#[cfg(test)]
mod testing;
mod watch;

use anyhow::{Context, Result};
use clap::Parser;
use cli::CliArgs;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    frontend::run(args).await
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}
