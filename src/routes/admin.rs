//! Administrative endpoints

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/shutdown", post(shutdown))
}

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub status: &'static str,
}

/// Same path as a termination signal: stop serving, then close the database
async fn shutdown(State(state): State<AppState>) -> (StatusCode, Json<ShutdownResponse>) {
    state.request_shutdown();
    (
        StatusCode::ACCEPTED,
        Json(ShutdownResponse {
            status: "shutting_down",
        }),
    )
}
