//! HTTP clients for the remote collaborators: face landmarks, image
//! cartoonization and image-to-3D generation.

pub mod landmarks;
pub mod meshy;
pub mod replicate;

use std::path::Path;
use std::time::Duration;

/// Errors from the provider HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The provider answered with a non-2xx status.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a client with a per-request timeout.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Return the response unchanged on 2xx, otherwise an `Api` error carrying
/// the status and body text.
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(ProviderError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

pub async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let response = ensure_success(response).await?;
    Ok(response.json::<T>().await?)
}

/// Fetch `url` into `dest` using a client with its own download timeout.
pub async fn download(url: &str, dest: &Path, timeout: Duration) -> Result<u64, ProviderError> {
    let client = http_client(timeout)?;
    let response = ensure_success(client.get(url).send().await?).await?;
    let bytes = response.bytes().await?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, &bytes).await?;
    tracing::debug!("Downloaded {} bytes to {}", bytes.len(), dest.display());
    Ok(bytes.len() as u64)
}
