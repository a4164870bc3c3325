use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use devflow_core::registry::DependencyRegistry;
use devflow_core::Supervisor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

mod handlers;

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DependencyRegistry>,
}

/// Serve the inter-process API until `supervisor` is cancelled
pub async fn serve(listener: TcpListener, state: AppState, supervisor: Supervisor) -> Result<()> {
    let app = create_router(state);
    tracing::info!("API server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { supervisor.cancelled().await })
        .await?;

    Ok(())
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health_check))
        .route("/api/ping", post(handlers::ping))
        .route("/api/exclude-dependency", post(handlers::exclude_dependency))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
        .with_state(Arc::new(state))
}

/// Body of every non-200 answer
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
