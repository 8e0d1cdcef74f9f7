//! imerg-sync - Incremental IMERG archive synchronizer
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use imerg_sync::catalog::{keys, CatalogStore, SqliteCatalog, WatermarkReader};
use imerg_sync::config::{CliArgs, Command, SyncConfig};
use imerg_sync::coordinator::{Reconciler, RunStatus};
use imerg_sync::pipeline::{Passthrough, RasterTransform};
use imerg_sync::progress::{print_header, print_status, print_summary, ProgressReporter};
use imerg_sync::remote::{HttpTransferClient, LocalMirrorClient, RemoteSource, TransferClient};
use imerg_sync::service::{ArcGisServiceControl, NoopServiceControl, ServiceControl};
use imerg_sync::timestamp::TimestampCodec;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Exit code when some files failed but the run finished
const EXIT_PARTIAL: u8 = 2;

/// Exit code after Ctrl-C
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    if let Some(Command::Status { catalog }) = &args.command {
        setup_logging(args.verbose, None, "")?;
        return show_status(catalog);
    }

    // Validate and create config
    let config = SyncConfig::from_args(args).context("Invalid configuration")?;

    setup_logging(config.verbose, config.log_dir.as_deref(), &config.log_prefix)?;

    let catalog = SqliteCatalog::open(&config.catalog_path, config.codec.clone())
        .context("Failed to open catalog")?;
    if let Err(e) = catalog.set_info(keys::SOURCE, &config.source.to_string()) {
        warn!("Failed to record source: {}", e);
    }

    let client = build_client(&config)?;
    let transform: Box<dyn RasterTransform> = match &config.transform {
        Some(command) => {
            info!("Filtering rasters with {}", command.program());
            Box::new(command.clone())
        }
        None => Box::new(Passthrough),
    };
    let service: Box<dyn ServiceControl> = match &config.service {
        Some(svc) => Box::new(
            ArcGisServiceControl::new(
                svc.target.clone(),
                svc.username.clone(),
                svc.password.clone(),
                config.timeout,
            )
            .context("Failed to initialize service control")?,
        ),
        None => Box::new(NoopServiceControl),
    };

    // Print header
    if config.show_progress {
        print_header(
            &config.source.to_string(),
            config.worker_count,
            &config.catalog_path.display().to_string(),
            &config.final_store.display().to_string(),
        );
    }

    let reconciler = Reconciler::new(
        client.as_ref(),
        transform.as_ref(),
        &catalog,
        service.as_ref(),
        config.reconcile_settings(),
    );

    // Setup signal handler for graceful shutdown
    let shutdown_flag = reconciler.shutdown_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, finishing in-flight files...");
        shutdown_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    // Create progress reporter
    let mut progress = if config.show_progress {
        let mut p = ProgressReporter::new();
        p.set_status("Reading watermarks...");
        p.watch(reconciler.counters());
        Some(p)
    } else {
        None
    };

    let summary = reconciler.run(Utc::now().date_naive());

    if let Some(ref mut p) = progress {
        p.finish(&format!("Sync {}", summary.status));
    }

    print_summary(&summary, &config.catalog_path.display().to_string());

    match summary.status {
        RunStatus::Completed => Ok(ExitCode::SUCCESS),
        RunStatus::Partial => {
            info!(failed = summary.failed(), "Sync completed with failures");
            Ok(ExitCode::from(EXIT_PARTIAL))
        }
        RunStatus::Interrupted => {
            info!("Sync was interrupted before completion");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        RunStatus::Failed => bail!(
            "Sync failed: {}",
            summary.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Pick the transfer client for the configured source
fn build_client(config: &SyncConfig) -> Result<Box<dyn TransferClient>> {
    match &config.source {
        RemoteSource::Local { root } => {
            info!("Reading local mirror at {}", root.display());
            Ok(Box::new(LocalMirrorClient::new()))
        }
        RemoteSource::Url { .. } => {
            let mut client = HttpTransferClient::new(
                &config.source,
                config.transfer_mode.clone(),
                config.timeout,
            )
            .context("Failed to initialize transfer client")?;
            if let Some((user, password)) = &config.credentials {
                client = client.with_credentials(user.clone(), password.clone());
            }
            info!(origin = %client.origin(), "Reading remote archive");
            Ok(Box::new(client))
        }
    }
}

fn show_status(catalog_path: &Path) -> Result<ExitCode> {
    if !catalog_path.exists() {
        bail!("Catalog '{}' does not exist", catalog_path.display());
    }
    let catalog = SqliteCatalog::open(catalog_path, TimestampCodec::default())
        .context("Failed to open catalog")?;

    let marks = WatermarkReader::new(&catalog)
        .read()
        .context("Failed to read watermarks")?;
    let stats = catalog
        .compute_statistics()
        .context("Failed to compute statistics")?;

    let last_run: Vec<(&str, Option<String>)> = [
        keys::SOURCE,
        keys::LAST_RUN_START,
        keys::LAST_RUN_END,
        keys::LAST_RUN_STATUS,
        keys::LAST_RUN_COMMITTED,
        keys::LAST_RUN_FAILED,
        keys::LAST_RUN_SUPERSEDED,
    ]
    .into_iter()
    .map(|key| Ok((key, catalog.get_info(key)?)))
    .collect::<Result<_, imerg_sync::error::CatalogError>>()
    .context("Failed to read run metadata")?;

    print_status(
        &catalog_path.display().to_string(),
        &marks,
        &stats,
        &last_run,
    );
    Ok(ExitCode::SUCCESS)
}

fn setup_logging(verbose: bool, log_dir: Option<&Path>, prefix: &str) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("imerg_sync=debug,warn")
    } else {
        EnvFilter::new("imerg_sync=info,warn")
    };

    let file_layer = match log_dir {
        Some(dir) => {
            let file = open_log_file(dir, prefix)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .with(file_layer)
        .init();

    Ok(())
}

/// Open `<prefix>_<YYYY-MM-DD>.log` for appending
fn open_log_file(dir: &Path, prefix: &str) -> Result<File> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let path = dir.join(format!("{}_{}.log", prefix, Utc::now().format("%Y-%m-%d")));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}
