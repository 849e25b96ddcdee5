//! pacpam CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pacpam_cli::{commands::CommandDispatcher, AppConfig, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_configuration(&cli)?;
    CommandDispatcher::execute(cli, config)
        .await
        .context("command failed")?;
    Ok(())
}

/// `RUST_LOG` wins over the verbosity flag
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn load_configuration(cli: &Cli) -> anyhow::Result<AppConfig> {
    match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            AppConfig::load_from_file(path).with_context(|| format!("loading {path}"))
        }
        None => {
            info!("Using default configuration");
            Ok(AppConfig::default())
        }
    }
}
