//! Creditflow: credit-based flow control over shared budget tables.
//!
//! # Usage
//!
//! ```bash
//! creditflow --workers 4 --duration-ms 1000 --log-level info
//! ```
//!
//! Environment variables can also be used:
//! - `CREDITFLOW_WORKERS`: Number of workers
//! - `CREDITFLOW_DIRECTORY`: Directory for file-backed budget tables
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! The run report is printed to stdout as JSON.

use anyhow::Context;
use creditflow::config::Config;
use creditflow::observability::tracing::init_tracing;
use creditflow::runner::run;
use std::fs;
use tokio::sync::watch;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    let directory = config
        .directory
        .as_ref()
        .map_or_else(|| "(anonymous)".to_string(), |dir| dir.display().to_string());
    let duration = config
        .duration()
        .map_or_else(|| "until interrupted".to_string(), |d| format!("{d:?}"));
    eprintln!(
        r#"
  Creditflow v{}

  Configuration:
    Workers:    {} x {} budgets, {} streams
    Window:     {} (claims {}..={})
    Tables:     {} slots, {}
    Duration:   {}
    Log Level:  {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.workers,
        config.budgets_per_worker,
        config.streams_per_worker,
        config.window,
        config.min_claim,
        config.max_claim,
        config.budgets_capacity,
        directory,
        duration,
        config.log_level
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    // Initialize tracing/logging
    init_tracing(&config.log_level, config.log_json);

    config.validate()?;

    // Ensure the table directory exists
    if let Some(directory) = &config.directory {
        fs::create_dir_all(directory)
            .with_context(|| format!("failed to create {}", directory.display()))?;
    }

    // Print startup banner
    print_banner(&config);

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn signal handler task
    let duration = config.duration();
    tokio::spawn(async move {
        let elapsed = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    tracing::error!(error = %error, "Failed to install SIGTERM handler");
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating shutdown...");
                }
                () = elapsed => {
                    tracing::info!("Run duration elapsed, initiating shutdown...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, initiating shutdown...");
                }
                () = elapsed => {
                    tracing::info!("Run duration elapsed, initiating shutdown...");
                }
            }
        }

        // Signal shutdown
        let _ = shutdown_tx.send(true);
    });

    // Run the workers
    let report = run(config, shutdown_rx).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.balanced {
        anyhow::bail!("budgets did not balance after the run");
    }

    tracing::info!("Creditflow shutdown complete");
    Ok(())
}
