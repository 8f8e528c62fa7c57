//! Log Agent - ships nginx access log lines to InfluxDB.
//!
//! Tails a single access log from its current end, parses every new line,
//! writes one point per request, and serves a self-monitoring snapshot.

use anyhow::{Context, Result};
use log_agent::config::Config;
use log_agent::runner;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::resolve().context("failed to load configuration")?;

    runner::run(&config).await
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
