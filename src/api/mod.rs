//! HTTP surface: trigger an installation run and observe its progress.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

use crate::installer::Installer;
use crate::models::responses::{InstallationFailed, InstallationSuccess, StatusPayload};

pub fn create_router(installer: Arc<Installer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/setup/installation", post(trigger_installation))
        .route("/setup/status", get(setup_status))
        .with_state(installer)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /setup/installation
///
/// Returns 409 with the current status while a run is in flight. A completed
/// run answers 200 in both directions: the request succeeded even when the
/// pipeline did not.
async fn trigger_installation(State(installer): State<Arc<Installer>>) -> Response {
    if !installer.try_start().await {
        let payload = StatusPayload::from_snapshot(installer.status().await);
        return (StatusCode::CONFLICT, Json(payload)).into_response();
    }

    let result = installer.run_installation().await;
    match result.outcome {
        Ok(schema_version) => (
            StatusCode::OK,
            Json(InstallationSuccess {
                status: "SUCCESS",
                schema_version,
                duration_seconds: result.duration.as_secs_f64(),
            }),
        )
            .into_response(),
        Err(failure) => (
            StatusCode::OK,
            Json(InstallationFailed {
                status: "FAILED",
                step: failure.step.as_str(),
                error: failure.error,
            }),
        )
            .into_response(),
    }
}

/// GET /setup/status
async fn setup_status(State(installer): State<Arc<Installer>>) -> Json<StatusPayload> {
    Json(StatusPayload::from_snapshot(installer.status().await))
}
