use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use film_gallery_server::config::Config;
use film_gallery_server::conflict::ConflictOrchestrator;
use film_gallery_server::db::{arm_shutdown_watchdog, DurabilityManager};
use film_gallery_server::routes;
use film_gallery_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "film_gallery_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Film Gallery Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Database: {}", config.database.path.display());

    let data_dir = config.database.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    // Merge leftovers from the sync client before the live connection exists
    let startup = ConflictOrchestrator::new(config.database.path.clone());
    if let Some(report) = startup.auto_cleanup().await {
        tracing::info!(
            "Startup conflict cleanup: {} found, pass {}",
            report.found,
            report.pass_id
        );
    }

    let durability = Arc::new(DurabilityManager::new(config.database.clone()));
    match durability.open().await {
        Ok(mode) => tracing::info!("Database serving in {} mode", mode),
        Err(e) => {
            tracing::error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    }

    let state = AppState::new(config.clone(), durability.clone());
    let app = routes::router(state.clone());

    let ip = config
        .server
        .host
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("Invalid SERVER_HOST {}", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    tracing::info!("Film Gallery Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("Server error")?;

    arm_shutdown_watchdog(config.database.shutdown_watchdog);

    match durability.shutdown().await {
        Ok(report) => {
            if let Some(checkpoint) = report.checkpoint {
                tracing::info!(
                    "Final checkpoint merged {} of {} frames",
                    checkpoint.changes_merged,
                    checkpoint.wal_frames
                );
            }
        }
        Err(e) => tracing::error!("Database shutdown failed: {}", e),
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
        _ = state.shutdown_requested() => {
            tracing::info!("Shutdown requested over HTTP, starting graceful shutdown...");
        },
    }
}
