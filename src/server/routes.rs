use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::errors::ForgeError;
use crate::models::ArtifactKind;
use crate::service::{parse_job_id, OutputFile};

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// Map a service error onto the HTTP status and error code clients see.
pub fn forge_error_response(err: &ForgeError) -> Response {
    let (status, code, message) = match err {
        ForgeError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
        ForgeError::MissingArtifact(m) => (StatusCode::NOT_FOUND, "missing_artifact", m),
        ForgeError::InvalidInput(m) => (StatusCode::BAD_REQUEST, "invalid_input", m),
        // Not-ready downloads are a client error, not a missing resource.
        ForgeError::NotReady(m) => (StatusCode::BAD_REQUEST, "not_ready", m),
        ForgeError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", m),
        ForgeError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m),
        ForgeError::InvalidTransition(m) => (StatusCode::CONFLICT, "invalid_transition", m),
        ForgeError::Config(m)
        | ForgeError::Storage(m)
        | ForgeError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", m),
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    } else {
        tracing::warn!("Request rejected: {}", err);
    }
    error_response(status, code, message)
}

fn multipart_error(err: MultipartError) -> ForgeError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ForgeError::PayloadTooLarge(err.body_text())
    } else {
        ForgeError::InvalidInput(err.body_text())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub status: String,
}

/// GET /
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "avatar-forge".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "running".to_string(),
    })
}

async fn read_upload(mut multipart: Multipart) -> Result<(String, Vec<u8>), ForgeError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.jpg").to_string();
        let data = field.bytes().await.map_err(multipart_error)?;
        return Ok((filename, data.to_vec()));
    }
    Err(ForgeError::InvalidInput(
        "Missing required 'file' field".to_string(),
    ))
}

/// POST /upload
pub async fn upload(State(state): State<Arc<AppState>>, multipart: Multipart) -> Response {
    let (filename, data) = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(e) => return forge_error_response(&e),
    };
    match state.service.submit(&filename, &data).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(e) => forge_error_response(&e),
    }
}

/// GET /status/{job_id}
pub async fn status(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let result = match parse_job_id(&job_id) {
        Ok(id) => state.service.status(id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => forge_error_response(&e),
    }
}

/// GET /preview/{job_id}
pub async fn preview(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    send_output(&state, &job_id, ArtifactKind::Model3d).await
}

/// GET /download/{job_id}/{kind}
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((job_id, kind)): Path<(String, String)>,
) -> Response {
    match kind.parse::<ArtifactKind>() {
        Ok(kind) => send_output(&state, &job_id, kind).await,
        Err(e) => forge_error_response(&e),
    }
}

async fn send_output(state: &AppState, job_id: &str, kind: ArtifactKind) -> Response {
    let file = match parse_job_id(job_id) {
        Ok(id) => state.service.fetch_output(id, kind).await,
        Err(e) => Err(e),
    };
    let OutputFile {
        path,
        media_type,
        download_name,
    } = match file {
        Ok(file) => file,
        Err(e) => return forge_error_response(&e),
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, media_type.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", download_name),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", path.display(), e);
            forge_error_response(&ForgeError::MissingArtifact(format!(
                "{} not found",
                kind.label()
            )))
        }
    }
}
