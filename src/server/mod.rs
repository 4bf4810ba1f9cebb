pub mod health;
pub mod routes;
pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::models::ServiceConfig;
use crate::pipeline::PipelineEvent;
use crate::service::JobService;

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Shared application state for the Axum server.
pub struct AppState {
    pub service: Arc<JobService>,
    pub event_tx: broadcast::Sender<PipelineEvent>,
    pub config: Arc<ServiceConfig>,
    pub start_time: Instant,
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_upload_bytes() + MULTIPART_OVERHEAD;
    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(health::health_check))
        .route("/upload", post(routes::upload))
        .route("/status/{job_id}", get(routes::status))
        .route("/preview/{job_id}", get(routes::preview))
        .route("/download/{job_id}/{kind}", get(routes::download))
        .route("/api/events", get(sse::sse_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
