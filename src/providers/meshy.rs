use std::time::Duration;

use serde::Deserialize;

use super::{ensure_success, http_client, parse_response, ProviderError};
use crate::pipeline::polling::PollState;

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    #[serde(alias = "id")]
    result: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelUrls {
    #[serde(default)]
    pub glb: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeshyTask {
    #[serde(default)]
    pub id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub model_urls: ModelUrls,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default, alias = "error")]
    pub task_error: Option<serde_json::Value>,
}

/// Client for the Meshy image-to-3D API.
pub struct MeshyClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl MeshyClient {
    pub fn new(api_url: String, api_key: String, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// `POST /image-to-3d` with the image as a PNG data URI. Returns the
    /// task id.
    pub async fn create_task(&self, image_data_uri: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "mode": "preview",
            "image_base64": image_data_uri,
            "enable_pbr": false,
        });
        let response = self
            .client
            .post(format!("{}/image-to-3d", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let created: CreateTaskResponse = parse_response(response).await?;
        Ok(created.result)
    }

    /// `GET /image-to-3d-tasks/{id}`.
    pub async fn get_task(&self, task_id: &str) -> Result<MeshyTask, ProviderError> {
        let response = self
            .client
            .get(format!("{}/image-to-3d-tasks/{}", self.api_url, task_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    /// One status check, folded into a poll result. Transport errors and
    /// non-2xx answers count as a failed task.
    pub async fn check(&self, task_id: &str) -> PollState<String> {
        match self.get_task(task_id).await {
            Ok(task) => {
                tracing::debug!("Meshy task {} {} ({}%)", task_id, task.status, task.progress);
                task.poll_state()
            }
            Err(e) => PollState::Failed(format!("3D generation failed: {}", e)),
        }
    }
}

impl MeshyTask {
    pub fn poll_state(&self) -> PollState<String> {
        match self.status.as_str() {
            "SUCCEEDED" => match &self.model_urls.glb {
                Some(url) => PollState::Ready(url.clone()),
                None => PollState::Failed("3D generation failed: no GLB model URL".to_string()),
            },
            "FAILED" | "EXPIRED" | "CANCELED" => PollState::Failed(format!(
                "3D generation failed: {}",
                self.error_message()
            )),
            _ => PollState::Pending,
        }
    }

    fn error_message(&self) -> String {
        match &self.task_error {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Object(map)) => map
                .get("message")
                .and_then(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .map(String::from)
                .unwrap_or_else(|| "Unknown error".to_string()),
            _ => "Unknown error".to_string(),
        }
    }
}
