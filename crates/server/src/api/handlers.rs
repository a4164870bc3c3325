use super::{AppState, ErrorResponse};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use devflow_core::registry::{ExcludeDecision, ExcludePayload, PingPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub project: String,
    #[serde(rename = "runID")]
    pub run_id: String,
    pub time: chrono::DateTime<chrono::Utc>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "devflow".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        project: state.registry.root().to_string(),
        run_id: state.registry.run_id().to_string(),
        time: chrono::Utc::now(),
    })
}

/// 200 while the pinged run is this process
pub async fn ping(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PingPayload>,
) -> Response {
    if state.registry.handle_ping(&payload.run_id) {
        StatusCode::OK.into_response()
    } else {
        tracing::debug!(run_id = %payload.run_id, "Ping for unknown run");
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("run {} is not running here", payload.run_id))),
        )
            .into_response()
    }
}

/// Another session wants to take over one of our dependencies
pub async fn exclude_dependency(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExcludePayload>,
) -> Response {
    let decision = state
        .registry
        .handle_exclude(&payload.run_id, &payload.dependency_name)
        .await;

    match decision {
        ExcludeDecision::Released => StatusCode::OK.into_response(),
        ExcludeDecision::Refused => (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new(format!(
                "dependency {} is not released by this session",
                payload.dependency_name
            ))),
        )
            .into_response(),
        ExcludeDecision::UnknownRun => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("run {} is not running here", payload.run_id))),
        )
            .into_response(),
    }
}
