//! posture-daemon - security finding ingestion and reconciliation
//!
//! # Commands
//!
//! - `run`: serve `POST /events` and `/metrics`, and sweep on a schedule
//!   until SIGINT or SIGTERM
//! - `ingest <file>`: process an NDJSON file of event envelopes once
//! - `sweep`: run one reconciliation sweep
//! - `status <finding-id>`: print a finding's state and remediation history
//! - `check-config`: validate the configuration and print it with defaults

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use posture_daemon::{DaemonConfig, Services};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// posture daemon - security finding ingestion and reconciliation
#[derive(Parser, Debug)]
#[command(name = "posture-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "posture.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve events and metrics, sweeping on the configured interval
    Run {
        /// Override the HTTP port from the configuration
        #[arg(long)]
        port: Option<u16>,
    },

    /// Process an NDJSON file of event envelopes
    Ingest {
        /// Event file, one envelope per line
        path: PathBuf,
    },

    /// Run one reconciliation sweep
    Sweep,

    /// Show stored state and history for a finding
    Status {
        /// Finding id
        finding_id: String,
    },

    /// Validate the configuration and print it with defaults applied
    CheckConfig,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;

    let config = DaemonConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    match args.command {
        Commands::CheckConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        },
        Commands::Ingest { path } => {
            let services = Services::from_config(&config)?;
            let summary = services.ingest_file(&path).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "events": summary.events,
                "outcomes": summary.outcomes,
                "failed_events": summary.failed_events,
            }))?);
            if summary.failed_events > 0 {
                bail!("{} event(s) failed and need redelivery", summary.failed_events);
            }
            Ok(())
        },
        Commands::Sweep => {
            let services = Services::from_config(&config)?;
            let report = services.sweep_once().await?;
            println!(
                "chunks={} pages={} successful={} failed={} error={} filtered={} filter_effectiveness={:.3}",
                report.chunks.len(),
                report.pages,
                report.totals.successful,
                report.totals.failed,
                report.totals.error,
                report.totals.filtered,
                report.filter_effectiveness,
            );
            Ok(())
        },
        Commands::Status { finding_id } => {
            let services = Services::from_config(&config)?;
            let (record, history) = services.describe(&finding_id).await?;
            let Some(record) = record else {
                bail!("no state recorded for finding {finding_id}");
            };
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "record": record,
                "history": history,
            }))?);
            Ok(())
        },
        Commands::Run { port } => run(&config, port).await,
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

async fn run(config: &DaemonConfig, port: Option<u16>) -> Result<()> {
    let services = Arc::new(Services::from_config(config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = ([127, 0, 0, 1], port.unwrap_or(config.metrics.port)).into();
    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(posture_daemon::server::serve(
        Arc::clone(&services),
        addr,
        async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        },
    ));

    let sweep_task = if services.sweep().is_ok() {
        Some(tokio::spawn(sweep_loop(
            Arc::clone(&services),
            config.sweep.interval(),
            shutdown_rx,
        )))
    } else {
        info!("Scheduled sweeps disabled: source.export_path is not configured");
        None
    };

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    let _ = shutdown_tx.send(true);
    if let Some(task) = sweep_task {
        if let Err(e) = task.await {
            error!("Sweep loop panicked: {}", e);
        }
    }
    match server_task.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => error!("HTTP server error: {:#}", e),
        Err(e) => error!("HTTP server task panicked: {}", e),
    }
    info!("Shutdown complete");
    Ok(())
}

async fn sweep_loop(services: Arc<Services>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = shutdown.wait_for(|stop| *stop) => return,
        }
        match services.sweep_once().await {
            Ok(report) => info!(
                processed = report.totals.total(),
                filtered = report.totals.filtered,
                "Scheduled sweep finished"
            ),
            Err(e) => warn!("Scheduled sweep failed: {:#}", e),
        }
    }
}
