//! HTTP routes

pub mod admin;
pub mod conflicts;
pub mod database;
pub mod health;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router with CORS and request tracing
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/database", database::router())
        .nest("/api/v1/conflicts", conflicts::router())
        .nest("/api/v1/admin", admin::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DB_FILE_NAME};
    use crate::db::{initialize_schema, DurabilityManager};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::SqlitePool;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_state(dir: &TempDir) -> AppState {
        let mut config = Config::default();
        config.database.path = dir.path().join(DB_FILE_NAME);

        let durability = Arc::new(DurabilityManager::new(config.database.clone()));
        durability.open().await.unwrap();
        AppState::new(config, durability)
    }

    async fn send(state: &AppState, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn write_copy(dir: &TempDir, name: &str) {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(dir.path().join(name))
                .create_if_missing(true),
        )
        .await
        .unwrap();
        initialize_schema(&pool).await.unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_health_reports_serving() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;

        for uri in ["/health", "/api/v1/health"] {
            let (status, body) = send(&state, "GET", uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["database"], "serving");
        }

        state.durability().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_database_health_and_checkpoint() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;

        let (status, body) = send(&state, "GET", "/api/v1/database/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "serving");
        assert_eq!(body["journalMode"], "wal");
        assert_eq!(body["database"]["exists"], true);

        let (status, body) = send(&state, "POST", "/api/v1/database/checkpoint").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["busy"], false);

        state.durability().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_after_shutdown_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        state.durability().shutdown().await.unwrap();

        let (status, body) = send(&state, "POST", "/api/v1/database/checkpoint").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "unavailable");
    }

    #[tokio::test]
    async fn test_conflict_listing_status_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        write_copy(&dir, "film-LAPTOP.db").await;

        let (status, body) = send(&state, "GET", "/api/v1/conflicts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["conflicts"][0]["originHostname"], "LAPTOP");

        let (status, body) = send(&state, "GET", "/api/v1/conflicts/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasConflicts"], true);
        assert_eq!(body["conflicts"][0]["needsMerge"], false);
        assert!(dir.path().join("film-LAPTOP.db").exists());

        let (status, body) = send(&state, "POST", "/api/v1/conflicts/cleanup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["found"], 1);
        assert_eq!(body["outcomes"][0]["disposition"], "archived");
        assert!(dir.path().join("film-LAPTOP.db.bak").exists());

        let (_, body) = send(&state, "GET", "/api/v1/conflicts").await;
        assert_eq!(body["count"], 0);

        state.durability().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_shutdown_signals_server() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;

        let (status, body) = send(&state, "POST", "/api/v1/admin/shutdown").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "shutting_down");

        tokio::time::timeout(Duration::from_secs(1), state.shutdown_requested())
            .await
            .expect("shutdown request should be observed");

        state.durability().shutdown().await.unwrap();
    }
}
