//! Health check endpoints

use axum::{extract::State, Json};
use serde::Serialize;

use crate::db::LifecyclePhase;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub database: LifecyclePhase,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let phase = state.durability().phase();

    Json(HealthResponse {
        status: if phase == LifecyclePhase::Serving {
            "healthy"
        } else {
            "degraded"
        },
        version: env!("CARGO_PKG_VERSION"),
        service: "film-gallery-server",
        database: phase,
    })
}
