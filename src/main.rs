//! volume-backup - Periodic Docker volume backups to S3-compatible storage
//!
//! Reads its settings from the environment (and an optional `.env` file),
//! then archives and uploads every target once per `SECOND_INTERVAL` until
//! SIGINT or SIGTERM.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use volume_backup::{
    Config, ConfigError, Coordinator, S3Store, Scheduler, APP_NAME, APP_VERSION, LOG_FILE_NAME,
};

// =============================================================================
// CLI
// =============================================================================

/// Periodic Docker volume backups to S3-compatible storage
#[derive(Parser, Debug)]
#[command(name = APP_NAME)]
#[command(about = "Archive mounted volumes and upload them to S3 on an interval")]
#[command(version)]
struct Cli {
    /// Environment file loaded before reading configuration (missing is fine)
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run a single cycle and exit; non-zero if any target failed
    #[arg(long)]
    once: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_loaded = match dotenvy::from_path(&cli.env_file) {
        Ok(()) => true,
        Err(e) if e.not_found() => false,
        Err(e) => {
            return Err(e).with_context(|| format!("failed to load {}", cli.env_file.display()))
        }
    };

    let config = match Config::from_env().and_then(prepare_output_dir) {
        Ok(config) => config,
        Err(e) => {
            init_logging(cli.verbose, None);
            tracing::error!("Invalid configuration: {e}");
            return Err(e.into());
        }
    };
    init_logging(cli.verbose, Some(&config.output_dir.join(LOG_FILE_NAME)));

    tracing::info!("{} v{}", APP_NAME, APP_VERSION);
    if env_loaded {
        tracing::info!("Loaded environment from {}", cli.env_file.display());
    }
    tracing::info!(
        backup_dir = %config.backup_dir.display(),
        output_dir = %config.output_dir.display(),
        bucket = %config.destination.bucket,
        prefix = %config.destination.prefix,
        retention = ?config.retention,
        "Targets: {}",
        config
            .targets
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let store = S3Store::connect(&config.destination).await?;
    let coordinator = Coordinator::new(Arc::new(config), Arc::new(store));

    if cli.once {
        let report = coordinator.run_cycle().await;
        if !report.is_complete() {
            anyhow::bail!("{} of {} targets failed", report.failed_count(), report.outcomes.len());
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    Scheduler::new(coordinator, shutdown_rx).run().await;
    Ok(())
}

/// Create the staging directory up front; an unusable one is fatal.
fn prepare_output_dir(config: Config) -> Result<Config, ConfigError> {
    std::fs::create_dir_all(&config.output_dir).map_err(|source| ConfigError::OutputDir {
        path: config.output_dir.clone(),
        source,
    })?;
    Ok(config)
}

/// Console logging, plus a plain-text copy appended to `log_file` when given.
fn init_logging(verbose: u8, log_file: Option<&Path>) {
    let default_filter = match verbose {
        0 => "info,aws_config=warn,aws_smithy_runtime=warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(e) => {
                eprintln!("{APP_NAME}: cannot open log file {}: {e}", path.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
