//! Application state management

use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::Config;
use crate::conflict::ConflictOrchestrator;
use crate::db::DurabilityManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    durability: Arc<DurabilityManager>,
    conflicts: ConflictOrchestrator,
    shutdown: Notify,
}

impl AppState {
    /// Create the application state around an already opened durability manager
    pub fn new(config: Config, durability: Arc<DurabilityManager>) -> Self {
        let conflicts = ConflictOrchestrator::new(config.database.path.clone());

        Self {
            inner: Arc::new(AppStateInner {
                config,
                durability,
                conflicts,
                shutdown: Notify::new(),
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the durability manager owning the live connection
    pub fn durability(&self) -> &Arc<DurabilityManager> {
        &self.inner.durability
    }

    /// Get the conflict orchestrator
    pub fn conflicts(&self) -> &ConflictOrchestrator {
        &self.inner.conflicts
    }

    /// Ask the server to stop. The request is remembered if nobody waits yet.
    pub fn request_shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.inner.shutdown.notify_one();
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) was called
    pub async fn shutdown_requested(&self) {
        self.inner.shutdown.notified().await;
    }
}
