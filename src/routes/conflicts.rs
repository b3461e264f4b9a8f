//! Conflict copy endpoints
//!
//! Listing and status are read-only. Cleanup merges and archives copies.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::conflict::{CleanupReport, ConflictFile, ConflictStatus};
use crate::error::{AppError, Result};
use crate::state::AppState;

/// Create the conflicts router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_conflicts))
        .route("/status", get(conflict_status))
        .route("/cleanup", post(cleanup))
}

#[derive(Serialize)]
pub struct ConflictListResponse {
    pub count: usize,
    pub conflicts: Vec<ConflictFile>,
}

async fn list_conflicts(State(state): State<AppState>) -> Json<ConflictListResponse> {
    let conflicts = state.conflicts().conflict_copies();
    Json(ConflictListResponse {
        count: conflicts.len(),
        conflicts,
    })
}

async fn conflict_status(State(state): State<AppState>) -> Json<ConflictStatus> {
    Json(state.conflicts().conflict_status().await)
}

async fn cleanup(State(state): State<AppState>) -> Result<Json<CleanupReport>> {
    state
        .conflicts()
        .auto_cleanup()
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No database to merge into".to_string()))
}
