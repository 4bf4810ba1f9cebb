use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{http_client, parse_response, ProviderError};
use crate::stages::face::LandmarkDetector;

/// One landmark in normalized image coordinates (0..1).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct LandmarkPoint {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DetectedFace {
    pub landmarks: Vec<LandmarkPoint>,
}

#[derive(Debug, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
}

/// Client for a landmark detection service exposing `POST /detect`, which
/// takes the raw image bytes and returns the faces it found.
pub struct HttpLandmarkDetector {
    client: reqwest::Client,
    api_url: String,
}

impl HttpLandmarkDetector {
    pub fn new(api_url: String, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn detect_bytes(&self, bytes: Vec<u8>) -> Result<Vec<DetectedFace>, ProviderError> {
        let response = self
            .client
            .post(format!("{}/detect", self.api_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        let parsed: DetectResponse = parse_response(response).await?;
        Ok(parsed.faces)
    }
}

#[async_trait]
impl LandmarkDetector for HttpLandmarkDetector {
    async fn detect(&self, image: &Path) -> anyhow::Result<Vec<DetectedFace>> {
        let bytes = tokio::fs::read(image).await?;
        Ok(self.detect_bytes(bytes).await?)
    }
}
