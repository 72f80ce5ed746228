//! # coursekeep
//!
//! Server binary: loads settings, wires the store, sync engine and HTTP
//! server together, and runs until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use coursekeep_engine::{
    DirectoryRegistry, HttpSink, LocalSink, OpenRegistry, PackageRegistry, ProcessorConfig,
    SessionRuntime, SyncProcessor, SyncScheduler, SyncSink, TrackingService,
};
use coursekeep_server::{AppState, ServerConfig};
use coursekeep_settings::{resolve_path, Settings, SyncMode};
use coursekeep_store::Database;
use coursekeep_telemetry::{init_telemetry, TelemetryConfig};

/// Learning-content tracking server.
#[derive(Parser, Debug)]
#[command(name = "coursekeep", version, about = "Learning-content tracking server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server and the sync scheduler.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Settings file (defaults to `~/.coursekeep/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Do not start the sync timer; passes still run on demand.
    #[arg(long)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

fn load_settings(args: &ServeArgs) -> Result<Settings> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(coursekeep_settings::settings_path);
    let mut settings = coursekeep_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(db) = &args.db {
        settings.storage.db_path = db.to_string_lossy().into_owned();
    }
    if args.no_scheduler {
        settings.sync.auto_start = false;
    }
    Ok(settings)
}

fn build_sink(settings: &Settings, runtime: Arc<SessionRuntime>) -> Result<Arc<dyn SyncSink>> {
    match settings.sync.mode {
        SyncMode::Local => Ok(Arc::new(LocalSink::new(runtime))),
        SyncMode::Forward => {
            let url = settings
                .sync
                .upstream_url
                .clone()
                .context("sync.upstreamUrl is required in forward mode")?;
            let timeout = Duration::from_millis(settings.sync.sink_timeout_ms);
            let sink = HttpSink::new(url, timeout).context("Failed to build upstream client")?;
            Ok(Arc::new(sink))
        }
    }
}

fn build_registry(settings: &Settings) -> Arc<dyn PackageRegistry> {
    match &settings.packages.dir {
        Some(dir) => Arc::new(DirectoryRegistry::new(resolve_path(dir))),
        None => Arc::new(OpenRegistry),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let settings = load_settings(&args)?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: settings.logging.level.clone(),
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: resolve_path(&settings.logging.log_db_path),
    });

    let db_path = resolve_path(&settings.storage.db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let runtime = Arc::new(SessionRuntime::new(db.clone()));
    let sink = build_sink(&settings, Arc::clone(&runtime))?;
    let processor = Arc::new(SyncProcessor::new(
        db.clone(),
        sink,
        ProcessorConfig::from(&settings.sync),
    ));
    let scheduler = Arc::new(SyncScheduler::new(
        processor,
        Duration::from_secs(settings.sync.interval_secs),
    ));
    let service = Arc::new(TrackingService::new(
        db,
        runtime,
        Arc::clone(&scheduler),
        build_registry(&settings),
        settings.server.max_upload_actions,
    ));

    if settings.sync.auto_start {
        scheduler.start();
    }

    let state = AppState::new(service, telemetry.log_sink());
    let handle = coursekeep_server::start(ServerConfig::from(&settings.server), state)
        .await
        .context("Failed to start server")?;
    tracing::info!(
        port = handle.port,
        mode = ?settings.sync.mode,
        scheduler = settings.sync.auto_start,
        "coursekeep ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    scheduler.shutdown().await;
    handle.shutdown().await;
    Ok(())
}
