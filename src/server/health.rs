use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::service::JobCounts;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub active_jobs: usize,
    pub total_jobs: usize,
    pub jobs: JobCounts,
    pub printer_profile: String,
    pub version: String,
    pub data_dir: String,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let uptime = state.start_time.elapsed().as_secs();

    let jobs = match state.service.counts().await {
        Ok(counts) => counts,
        Err(e) => {
            tracing::warn!("Health check could not count jobs: {}", e);
            JobCounts::default()
        }
    };
    let total_jobs = jobs.pending + jobs.processing + jobs.completed + jobs.failed;

    let response = HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: uptime,
        active_jobs: state.service.active_count().await,
        total_jobs,
        jobs,
        printer_profile: state.config.printer_profile.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        data_dir: state.service.artifacts().root().display().to_string(),
    };

    (StatusCode::OK, Json(response))
}
