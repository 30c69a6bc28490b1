//! `relink` command line entry point.
//!
//! Validates the effective configuration and, with `--simulate`, drives one
//! scripted incident through the engine against in-process collaborators.

mod cli;
mod simulate;

use std::time::Duration;

use clap::Parser;
use relink::HealthConfig;
use tracing::info;

fn apply_overrides(cli: &cli::Cli, mut config: HealthConfig) -> HealthConfig {
    if let Some(secs) = cli.window_secs {
        config.window = Duration::from_secs(secs);
    }
    if let Some(threshold) = cli.error_threshold {
        config.error_threshold = threshold;
    }
    if let Some(attempts) = cli.max_attempts {
        config.max_attempts = attempts;
    }
    if let Some(secs) = cli.cooldown_secs {
        config.cooldown_delay = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.scan_interval_secs {
        config.base_scan_interval = Duration::from_secs(secs);
    }
    if let Some(attempts) = cli.retry_max_attempts {
        config.retry_max_attempts = attempts;
    }
    if let Some(ms) = cli.drain_interval_ms {
        config.drain_interval = Duration::from_millis(ms);
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let config = apply_overrides(&cli, HealthConfig::default());
    config.validate()?;
    info!(?config, "configuration accepted");

    if let Some(addr) = cli.metrics_addr {
        install_exporter(addr)?;
    }

    if cli.simulate {
        let summary = simulate::run(config).await?;
        println!("{summary}");
    }

    // Keep the exporter reachable until interrupted.
    if cli.metrics_addr.is_some() {
        info!("serving until interrupted");
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(feature = "metrics")]
fn install_exporter(addr: std::net::SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(%addr, "serving metrics");
    Ok(())
}

#[cfg(not(feature = "metrics"))]
#[expect(
    clippy::unnecessary_wraps,
    reason = "signature matches the metrics-enabled build"
)]
fn install_exporter(addr: std::net::SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    tracing::warn!(%addr, "built without the metrics feature; exporter not started");
    Ok(())
}
