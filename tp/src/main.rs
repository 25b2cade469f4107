//! TilePipe - image tile pipeline orchestrator
//!
//! CLI entry point for the scheduler daemon and its child stage workers.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use tilepipe::catalog::{CatalogSeed, MemoryCatalog};
use tilepipe::cli::{Cli, Command, OutputFormat};
use tilepipe::config::Config;
use tilepipe::daemon::DaemonManager;
use tilepipe::fleet::{FleetClient, HttpWorkerClient, WorkerRegistry};
use tilepipe::scheduler::{serve_stage_worker, HubConfig, SchedulerHub, StageScheduler, StageSchedulerOptions};

fn setup_logging(verbose: bool) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tilepipe")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Write to the log file, not stdout/stderr - stdout belongs to the
    // stage worker control protocol
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    // Append: the daemon and its stage worker processes share this file
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("tilepipe.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate()?;

    match cli.command {
        Some(Command::Start { foreground }) => cmd_start(&config, cli.config.clone(), foreground).await,
        Some(Command::Stop) => cmd_stop().await,
        Some(Command::Status { format }) => cmd_status(format).await,
        Some(Command::RunDaemon) => cmd_run_daemon(&config, cli.config.clone()).await,
        Some(Command::StageWorker { stage_id }) => cmd_stage_worker(&config, &stage_id).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

/// Start the daemon
async fn cmd_start(config: &Config, config_path: Option<PathBuf>, foreground: bool) -> Result<()> {
    let daemon = DaemonManager::new();

    if daemon.is_running() {
        println!("TilePipe is already running (PID: {})", daemon.running_pid().unwrap());
        return Ok(());
    }

    if foreground {
        println!("Starting TilePipe in foreground mode...");
        run_daemon(config, config_path).await
    } else {
        let pid = daemon.start(config_path.as_ref())?;
        println!("TilePipe started (PID: {})", pid);
        Ok(())
    }
}

/// Stop the daemon
async fn cmd_stop() -> Result<()> {
    let daemon = DaemonManager::new();

    if !daemon.is_running() {
        println!("TilePipe is not running");
        return Ok(());
    }

    let pid = daemon.running_pid().unwrap();
    daemon.stop()?;
    println!("TilePipe stopped (was PID: {})", pid);
    Ok(())
}

/// Show daemon status
async fn cmd_status(format: OutputFormat) -> Result<()> {
    let daemon = DaemonManager::new();
    let status = daemon.status();

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "running": status.running,
                "pid": status.pid,
                "pid_file": status.pid_file.to_string_lossy()
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("TilePipe Status");
            println!("---------------");
            if status.running {
                println!("Status: {}", "running".green());
                println!("PID: {}", status.pid.unwrap());
            } else {
                println!("Status: {}", "stopped".red());
            }
            println!("PID file: {}", status.pid_file.display());
        }
    }

    Ok(())
}

/// Run as the daemon process, registering the PID file
async fn cmd_run_daemon(config: &Config, config_path: Option<PathBuf>) -> Result<()> {
    let daemon = DaemonManager::new();
    daemon.register_self()?;

    let result = run_daemon(config, config_path).await;

    if let Err(err) = daemon.unregister_self() {
        warn!(error = %err, "failed to remove PID file on shutdown");
    }
    result
}

/// Build the shared services and run the scheduler hub until a shutdown
/// signal arrives.
async fn run_daemon(config: &Config, config_path: Option<PathBuf>) -> Result<()> {
    let (catalog, registry, fleet) = build_services(config).await?;

    let hub_config = HubConfig {
        poll_interval: config.scheduling.hub_interval(),
        stage_interval: config.scheduling.stage_interval(),
        project_interval: config.scheduling.project_interval(),
        batch_size: config.storage.batch_size,
        child_process_workers: config.scheduling.child_process_workers,
        child_config: config_path,
    };
    let hub = SchedulerHub::new(catalog, registry, fleet, hub_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    hub.run(shutdown_rx).await;
    Ok(())
}

/// Run one stage worker, driven over stdin/stdout by the parent daemon
async fn cmd_stage_worker(config: &Config, stage_id: &str) -> Result<()> {
    let (catalog, registry, fleet) = build_services(config).await?;

    let handle = StageScheduler::spawn(
        catalog,
        registry,
        fleet,
        stage_id,
        StageSchedulerOptions {
            interval: config.scheduling.stage_interval(),
            batch_size: config.storage.batch_size,
        },
    )
    .await?;

    serve_stage_worker(handle).await
}

async fn build_services(config: &Config) -> Result<(Arc<MemoryCatalog>, Arc<WorkerRegistry>, Arc<FleetClient>)> {
    let catalog = Arc::new(load_catalog(config).await?);
    let registry = Arc::new(WorkerRegistry::new());
    let client = Arc::new(HttpWorkerClient::new(config.fleet.request_timeout())?);
    let fleet = Arc::new(FleetClient::new(client, catalog.clone()));
    Ok((catalog, registry, fleet))
}

async fn load_catalog(config: &Config) -> Result<MemoryCatalog> {
    match &config.catalog.seed_path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .context(format!("Failed to read catalog seed from {}", path.display()))?;
            let seed: CatalogSeed = serde_yaml::from_str(&content).context("Failed to parse catalog seed")?;
            info!(path = %path.display(), "Loaded catalog seed");
            Ok(MemoryCatalog::from_seed(seed).await?)
        }
        None => {
            warn!("No catalog seed configured; starting with an empty catalog");
            Ok(MemoryCatalog::new())
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
