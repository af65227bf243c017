use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

mod app;
mod http;

/// Cadence job scheduler: timer engine plus management API.
#[derive(Debug, Parser)]
#[command(name = "cadence-gateway", version)]
struct Cli {
    /// Path to the TOML config file (default: $CADENCE_CONFIG or ~/.cadence/cadence.toml).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence_gateway=info,cadence_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = cadence_core::CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        cadence_core::CadenceConfig::default()
    });

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = open_db(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    cadence_scheduler::db::init_db(&db)?;
    info!("database migrations complete");

    // registry and history each get their own connection
    let kernel = Arc::new(cadence_scheduler::SchedulerKernel::new(
        open_db(&db_path)?,
        open_db(&db_path)?,
        &config.runtime,
        &config.scheduler,
    )?);

    if config.scheduler.restore_outcomes {
        match kernel.restore_outcomes() {
            Ok(n) => info!(jobs = n, "dependency outcomes restored"),
            Err(e) => warn!("outcome restore failed, starting with none: {e}"),
        }
    }

    // spawn scheduler engine loop in background
    let engine = cadence_scheduler::SchedulerEngine::new(
        Arc::clone(&kernel),
        Duration::from_millis(config.scheduler.tick_ms.max(10)),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, kernel));
    let router = app::build_router(state);

    info!("Cadence gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // signal scheduler to stop
    let _ = shutdown_tx.send(true);
    let _ = engine_task.await;
    Ok(())
}

fn open_db(path: &str) -> rusqlite::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
