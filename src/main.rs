//! Fault Explainer - real-time process fault detection and explanation
//!
//! # Usage
//!
//! ```bash
//! # HTTP ingestion only (POST /api/v1/ingest)
//! cargo run --release
//!
//! # Replay a recorded CSV at 5 rows per second
//! cargo run --release -- --csv data/fault1.csv --speed 5
//!
//! # Rows as JSON lines from another process
//! python simulator.py | ./fault-explainer --stdin
//!
//! # Synthetic rows drifting into a fault after 60 rows
//! cargo run --release -- --synthetic
//! ```
//!
//! # Environment Variables
//!
//! - `FAULT_EXPLAINER_CONFIG`: Path to the TOML config (default: ./fault_explainer.toml)
//! - `FAULT_EXPLAINER_CORS_ORIGINS`: Comma-separated origins allowed by CORS
//! - `ANTHROPIC_API_KEY`, `GEMINI_API_KEY`: Keys for hosted backends (also read from `.env`)
//! - `RUST_LOG`: Logging level (default: info)
//! - `RESET_DB`: Set to "true" to wipe the analysis history on startup

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fault_explainer::api::create_app;
use fault_explainer::baseline::{BaselineDetector, BaselineStats};
use fault_explainer::config::watcher::{run_config_watcher, ConfigEvent};
use fault_explainer::config::{defaults, HistoryConfig, ServiceConfig};
use fault_explainer::llm::{build_backend, AnalysisBackend};
use fault_explainer::pipeline::source::pacing;
use fault_explainer::pipeline::{CsvSource, RowSource, StdinSource, SyntheticSource};
use fault_explainer::service::{Service, ServiceParts};
use fault_explainer::storage::open_history;
use fault_explainer::types::FeatureSchema;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "fault-explainer")]
#[command(about = "Real-time process fault detection with multi-backend root-cause analysis")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file
    #[arg(short, long, env = "FAULT_EXPLAINER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the server address (default: "0.0.0.0:8000")
    #[arg(short, long)]
    addr: Option<String>,

    /// Replay rows from a CSV file with a header row
    #[arg(long, conflicts_with_all = ["stdin", "synthetic"])]
    csv: Option<PathBuf>,

    /// Read rows from stdin, one JSON object per line
    #[arg(long, conflicts_with = "synthetic")]
    stdin: bool,

    /// Generate rows from the baseline, drifting into a fault
    #[arg(long)]
    synthetic: bool,

    /// Rows per second for CSV replay and synthetic data (0 = no delay)
    #[arg(long, default_value = "1")]
    speed: f64,

    /// Wipe the persisted analysis history on startup.
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

// ============================================================================
// Database Reset
// ============================================================================

/// Check if database reset is requested via CLI flag or environment variable.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val_lower = val.to_lowercase();
        return val_lower == "true" || val_lower == "1" || val_lower == "yes";
    }
    false
}

/// Remove the history database before it is opened.
fn reset_history(config: &HistoryConfig) -> Result<()> {
    if config.in_memory {
        info!("History is in-memory, nothing to reset");
        return Ok(());
    }
    let path = config.db_path.as_path();
    if !path.exists() {
        info!("History database does not exist, nothing to reset");
        return Ok(());
    }

    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("  RESET_DB DETECTED - WIPING ANALYSIS HISTORY");
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("  Removing: {}", path.display());

    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
    .with_context(|| format!("Failed to remove {}", path.display()))?;

    warn!("  A fresh history will be created on startup.");
    Ok(())
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    RowProcessor,
    ConfigWatcher,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::RowProcessor => write!(f, "RowProcessor"),
            TaskName::ConfigWatcher => write!(f, "ConfigWatcher"),
        }
    }
}

// ============================================================================
// Startup
// ============================================================================

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config(explicit: Option<&Path>) -> Result<ServiceConfig> {
    let config = match explicit {
        Some(path) => ServiceConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ServiceConfig::load(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_backends(config: &ServiceConfig) -> Result<Vec<Arc<dyn AnalysisBackend>>> {
    let mut backends = Vec::new();
    for backend_config in config.backends.iter().filter(|b| b.enabled) {
        match build_backend(backend_config) {
            Ok(backend) => {
                info!(
                    "✓ Backend '{}' ({:?}, {:?}, timeout {}s)",
                    backend_config.id,
                    backend_config.kind,
                    backend_config.tier(),
                    backend_config.timeout().as_secs()
                );
                backends.push(backend);
            }
            Err(e) => warn!("Backend '{}' skipped: {:#}", backend_config.id, e),
        }
    }
    if backends.is_empty() {
        anyhow::bail!("No analysis backend could be started; enable at least one in [[backends]]");
    }
    Ok(backends)
}

// ============================================================================
// Supervised Tasks
// ============================================================================

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Follow the config file and push `[runtime]` changes to the ingest actor.
fn spawn_config_watcher(
    task_set: &mut JoinSet<Result<TaskName>>,
    path: PathBuf,
    service: &Service,
    cancel_token: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel(8);
    let runtime = service.runtime.clone();
    let ingest = service.ingest.clone();

    task_set.spawn(async move {
        info!("[ConfigWatcher] Task starting");
        let watcher = tokio::spawn(run_config_watcher(path, runtime, tx, cancel_token.clone()));

        while let Some(event) = rx.recv().await {
            match event {
                ConfigEvent::Reloaded(changes) if changes.is_empty() => {
                    info!("[ConfigWatcher] Config file touched, runtime section unchanged");
                }
                ConfigEvent::Reloaded(changes) => {
                    info!("[ConfigWatcher] Applied {} runtime change(s)", changes.len());
                    if let Err(e) = ingest.reconfigure().await {
                        warn!("[ConfigWatcher] Ingest actor not reachable: {}", e);
                    }
                }
                ConfigEvent::Error(e) => warn!("[ConfigWatcher] Reload rejected: {}", e),
            }
        }

        if let Err(e) = watcher.await {
            warn!("[ConfigWatcher] Watcher task ended abnormally: {}", e);
        }
        Ok(TaskName::ConfigWatcher)
    });
}

fn spawn_row_processor(
    task_set: &mut JoinSet<Result<TaskName>>,
    mut source: Box<dyn RowSource>,
    service: &Service,
    cancel_token: CancellationToken,
) {
    let processing_loop = service.processing_loop(cancel_token);
    task_set.spawn(async move {
        info!("[RowProcessor] Task starting ({})", source.source_name());
        let (_stats, reason) = processing_loop.run(source.as_mut()).await;
        info!("[RowProcessor] Stopped: {:?}", reason);
        Ok(TaskName::RowProcessor)
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("🛑 Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Supervisor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Supervisor: Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("🔒 Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("🔒 Supervisor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real environment variables win
    let _ = dotenvy::dotenv();

    let args = CliArgs::parse();
    init_logging(args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr.clone() {
        config.server.addr = addr;
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Fault Explainer");
    info!("  Process fault detection with multi-backend analysis");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("");

    // Detector: a missing or incomplete baseline is fatal
    let schema = FeatureSchema::new(config.features.columns.iter().cloned());
    let baseline = Arc::new(
        BaselineStats::load_csv(&config.features.baseline_path)
            .context("Detector unavailable: baseline statistics could not be loaded")?,
    );
    let detector = BaselineDetector::new(Arc::clone(&baseline), &schema, config.detector.alpha)
        .context("Detector unavailable")?;
    info!(
        "📊 Detector: {} features, chi-squared threshold {:.2}",
        schema.len(),
        detector.threshold()
    );

    let backends = build_backends(&config)?;

    if should_reset_db(args.reset_db) {
        reset_history(&config.history)?;
    }
    info!("💾 Opening analysis history...");
    let history = open_history(&config.history).context("Failed to open analysis history")?;
    info!("✓ Analysis history ready ({} bundles)", history.len());

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let server_addr = config.server.addr.clone();
    let watch_path = args.config.clone().or_else(ServiceConfig::resolved_path);

    let mut actors: JoinSet<()> = JoinSet::new();
    let service = Service::start(
        ServiceParts {
            config,
            detector: Arc::new(detector),
            baseline: Some(Arc::clone(&baseline)),
            backends,
            history,
        },
        &mut actors,
        &cancel_token,
    );

    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", server_addr))?;
    info!("✓ HTTP server listening on {}", server_addr);
    info!("   Stream: http://{}/api/v1/stream", server_addr);
    info!("");

    info!("🔒 Supervisor: Initializing task monitoring");
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    spawn_http_server(
        &mut task_set,
        listener,
        create_app(service.state.clone()),
        cancel_token.clone(),
    );

    if let Some(path) = watch_path {
        spawn_config_watcher(&mut task_set, path, &service, cancel_token.clone());
    }

    let delay = pacing(args.speed);
    let source: Option<Box<dyn RowSource>> = if let Some(path) = &args.csv {
        info!("📥 Input: CSV replay from {} ({:?} between rows)", path.display(), delay);
        Some(Box::new(CsvSource::open(path, delay)?))
    } else if args.stdin {
        info!("📥 Input: stdin (JSON rows, one per line)");
        Some(Box::new(StdinSource::new()))
    } else if args.synthetic {
        info!(
            "📥 Input: synthetic rows, fault injected after {} rows",
            defaults::SYNTHETIC_FAULT_AFTER
        );
        Some(Box::new(SyntheticSource::new(
            &schema,
            Arc::clone(&baseline),
            defaults::SYNTHETIC_FAULT_AFTER,
            delay,
            rand::random(),
        )?))
    } else {
        info!("📥 Input: HTTP only (POST /api/v1/ingest)");
        None
    };
    if let Some(source) = source {
        spawn_row_processor(&mut task_set, source, &service, cancel_token.clone());
    }

    let outcome = run_supervisor(&mut task_set, cancel_token.clone()).await;

    cancel_token.cancel();
    let drain = async {
        while actors.join_next().await.is_some() {}
        while task_set.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("Some tasks did not stop within 5s, exiting anyway");
    }

    outcome?;
    info!("");
    info!("✓ Fault Explainer shutdown complete");
    Ok(())
}
