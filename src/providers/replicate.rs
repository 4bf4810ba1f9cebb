use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{http_client, parse_response, ProviderError};
use crate::pipeline::polling::PollState;

/// Prediction record as returned by the Replicate predictions API.
#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// SDXL image-to-image inputs.
#[derive(Debug, Clone, Serialize)]
pub struct ImageToImageInput {
    pub image: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub prompt_strength: f32,
    pub scheduler: String,
}

pub struct ReplicateClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
    model_version: String,
}

impl ReplicateClient {
    pub fn new(
        api_url: String,
        token: String,
        model_version: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            model_version,
        })
    }

    /// `POST /predictions`.
    pub async fn create_prediction(&self, input: &ImageToImageInput) -> Result<Prediction, ProviderError> {
        let body = serde_json::json!({
            "version": self.model_version,
            "input": input,
        });
        let response = self
            .client
            .post(format!("{}/predictions", self.api_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        parse_response(response).await
    }

    /// `GET /predictions/{id}`.
    pub async fn get_prediction(&self, id: &str) -> Result<Prediction, ProviderError> {
        let response = self
            .client
            .get(format!("{}/predictions/{}", self.api_url, id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        parse_response(response).await
    }
}

impl Prediction {
    /// Map the prediction status onto a poll result; a finished prediction
    /// yields the URL of its first output image.
    pub fn poll_state(&self) -> PollState<String> {
        match self.status.as_str() {
            "succeeded" => match self.output.as_ref().and_then(first_output_url) {
                Some(url) => PollState::Ready(url),
                None => PollState::Failed("prediction succeeded without an output image".to_string()),
            },
            "failed" | "canceled" => {
                let reason = self
                    .error
                    .as_ref()
                    .map(|e| match e {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| format!("prediction {}", self.status));
                PollState::Failed(reason)
            }
            _ => PollState::Pending,
        }
    }
}

fn first_output_url(output: &serde_json::Value) -> Option<String> {
    match output {
        serde_json::Value::String(url) => Some(url.clone()),
        serde_json::Value::Array(items) => items.iter().find_map(|v| v.as_str().map(String::from)),
        _ => None,
    }
}
