use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use hearth_engine::{QueryService, ReconcilerConfig, StateReconciler};
use hearth_server::ServerConfig;
use hearth_store::{apply_migrations, Database, DeviceRepo, EventStore};
use hearth_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "hearth", about = "Thermostat device event service")]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, default_value = "hearth.db")]
    db_path: PathBuf,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Max device states held by the reconciler cache.
    #[arg(long, default_value_t = 1024)]
    cache_capacity: usize,

    /// Per-request deadline in seconds for store operations.
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json: cli.json_logs,
        ..Default::default()
    });

    let db = match Database::open(&cli.db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "failed to open database");
            return ExitCode::FAILURE;
        }
    };

    // Migrations run to completion before anything serves traffic
    match apply_migrations(&db) {
        Ok(applied) => tracing::info!(applied, "schema migrations complete"),
        Err(e) => {
            tracing::error!(error = %e, "schema migration failed, refusing to serve");
            return ExitCode::FAILURE;
        }
    }

    let events = Arc::new(EventStore::new(db.clone()));
    let reconciler = StateReconciler::new(
        Arc::clone(&events),
        ReconcilerConfig {
            cache_capacity: cli.cache_capacity,
        },
    );
    let devices = DeviceRepo::new(db);
    let service = Arc::new(QueryService::new(
        events,
        reconciler,
        devices,
        Duration::from_secs(cli.request_timeout_secs),
    ));

    let config = ServerConfig {
        port: cli.port,
        request_timeout_secs: cli.request_timeout_secs,
    };
    let handle = match hearth_server::start(config, service).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(port = handle.port, "hearth ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return ExitCode::FAILURE;
    }
    tracing::info!("shutting down");
    ExitCode::SUCCESS
}
