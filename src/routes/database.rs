//! Database durability endpoints

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::db::{CheckpointReport, DatabaseHealth, JournalMode, LifecyclePhase};
use crate::error::Result;
use crate::state::AppState;

/// Create the database router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(database_health))
        .route("/checkpoint", post(checkpoint))
}

#[derive(Serialize)]
pub struct DatabaseHealthResponse {
    pub phase: LifecyclePhase,
    #[serde(rename = "journalMode", skip_serializing_if = "Option::is_none")]
    pub journal_mode: Option<JournalMode>,
    #[serde(rename = "writeThrough")]
    pub write_through: bool,
    #[serde(flatten)]
    pub report: DatabaseHealth,
}

/// File sizes, engine settings and warnings for the live database
async fn database_health(State(state): State<AppState>) -> Result<Json<DatabaseHealthResponse>> {
    let durability = state.durability();
    let report = durability.health().await?;

    Ok(Json(DatabaseHealthResponse {
        phase: durability.phase(),
        journal_mode: durability.journal_mode().await,
        write_through: durability.write_through().await,
        report,
    }))
}

/// Fold the write-ahead log into the main file now
async fn checkpoint(State(state): State<AppState>) -> Result<Json<CheckpointReport>> {
    let report = state.durability().checkpoint().await?;
    Ok(Json(report))
}
