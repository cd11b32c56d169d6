//! Database Backup Tool
//!
//! Runs a single backup cycle: wait for Postgres, dump it, upload the dump to S3-compatible
//! storage and prune old backups. Scheduling is left to cron or the orchestrator.

// pgvault/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use config::BackupConfig;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run_app().await {
        Ok(_) => {
            println!("✅ Backup completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Backup failed");
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pgvault=info"));

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    match log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init(),
    }
}

async fn run_app() -> Result<()> {
    info!("pgvault v{} starting", VERSION);

    let config = BackupConfig::load_from_env().context("Failed to load backup configuration")?;
    info!(config = ?config, "Configuration loaded");

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    backup::run_backup_flow(&config, &cancel).await?;
    Ok(())
}

/// Cancels the run on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => warn!("Received SIGINT, aborting backup"),
                    _ = sigterm.recv() => warn!("Received SIGTERM, aborting backup"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler, listening for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                warn!("Received SIGINT, aborting backup");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        warn!("Received Ctrl-C, aborting backup");
    }
    cancel.cancel();
}
