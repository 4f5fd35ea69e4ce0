//! vigild — the Vigil daemon.
//!
//! Single binary that assembles the Vigil subsystems:
//! - History store (redb) and its background writer
//! - Metrics store
//! - Alert queue and dispatcher (log / webhook sinks)
//! - Health monitor with one poll task per service
//! - HTTP API
//!
//! # Usage
//!
//! ```text
//! vigild run --config /etc/vigil/vigil.toml [--port 8450] [--log-format json]
//! vigild validate --config /etc/vigil/vigil.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info};

use vigil_core::VigilConfig;
use vigil_dashboard::{AlertSink, Alerter, LogSink, WebhookSink};
use vigil_health::HealthMonitor;
use vigil_metrics::{HistoryWriter, MetricsStore};
use vigil_state::StateStore;

#[derive(Parser)]
#[command(name = "vigild", about = "Vigil service health daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Monitor the configured services and serve the HTTP API.
    Run {
        /// Path to vigil.toml.
        #[arg(long, default_value = "vigil.toml")]
        config: PathBuf,

        /// Override `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Parse and validate a config file, then exit.
    Validate {
        #[arg(long, default_value = "vigil.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vigild=debug,vigil=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            log_format,
        } => {
            init_tracing(log_format);
            run(&config, port).await
        }
        Command::Validate { config } => validate(&config),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = VigilConfig::from_file(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    println!(
        "{}: ok ({} services, history {})",
        path.display(),
        config.services.len(),
        if config.history.path.is_some() { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn run(path: &Path, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = VigilConfig::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    if let Some(port) = port {
        config.server.port = port;
    }
    info!(config = %path.display(), services = config.services.len(), "Vigil daemon starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    // ── History ────────────────────────────────────────────────

    let mut metrics = MetricsStore::new();
    let store = match &config.history.path {
        Some(db_path) => {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let store = StateStore::open(db_path)?;
            info!(path = ?db_path, "history store opened");

            let (writer, handle) = HistoryWriter::spawn(
                store.clone(),
                config.history.queue_capacity,
                config.history.retention,
                shutdown_rx.clone(),
            );
            metrics = metrics.with_history(writer);
            background.push(handle);
            Some(store)
        }
        None => {
            info!("history disabled");
            None
        }
    };

    // ── Alerts ─────────────────────────────────────────────────

    let alerter = Arc::new(Alerter::new(config.alerts.queue_capacity));
    let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
    if config.alerts.log {
        sinks.push(Arc::new(LogSink));
    }
    if let Some(webhook) = &config.alerts.webhook {
        info!(address = %webhook.address, path = %webhook.path, "webhook alerts enabled");
        sinks.push(Arc::new(WebhookSink::new(webhook.clone())));
    }
    background.push(alerter.spawn_dispatcher(sinks, shutdown_rx.clone()));

    // ── Monitor ────────────────────────────────────────────────

    let mut monitor = HealthMonitor::new(Arc::new(metrics), alerter)
        .with_snapshot_ttl(config.dashboard.snapshot_ttl);
    if let Some(store) = store {
        monitor = monitor.with_store(store);
    }
    let monitor = Arc::new(monitor);

    for service in &config.services {
        monitor
            .register(service.clone())
            .await
            .with_context(|| format!("failed to register {}", service.id))?;
    }
    let restored = monitor.load_persisted().await?;
    info!(
        configured = config.services.len(),
        restored, "health monitors started"
    );

    // ── API server ─────────────────────────────────────────────

    let state = vigil_api::ApiState::new(monitor.clone(), config.server.admin_token.clone());
    let router = vigil_api::build_router(state);
    let listener =
        tokio::net::TcpListener::bind((config.server.bind.as_str(), config.server.port)).await?;
    info!(addr = %listener.local_addr()?, "API server starting");

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await?;

    // Poll tasks first, so the history writer and alert dispatcher drain
    // their final results.
    monitor.stop_all().await;
    let _ = shutdown_tx.send(true);
    for handle in background {
        let _ = handle.await;
    }

    info!("Vigil daemon stopped");
    Ok(())
}
