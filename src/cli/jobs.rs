// CLI job commands: submit, status, download, profiles

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde_json::Value;

use super::{base_url, connection_error_message};
use crate::models::printer;
use crate::models::{ArtifactKind, JobStatusView};

/// Helper to handle reqwest errors and produce a user-friendly connection error.
fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// Turn a non-2xx response into an error carrying the server's message.
async fn error_from_response(response: Response) -> anyhow::Error {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let message = body["message"].as_str().unwrap_or("Unknown error");
    anyhow::anyhow!("{} ({})", message, status)
}

fn format_progress_bar(progress: u8) -> String {
    let filled = (progress as usize).min(100) / 5;
    format!("[{}{}] {:>3}%", "#".repeat(filled), "-".repeat(20 - filled), progress)
}

/// Human-readable status block.
pub fn format_status(view: &JobStatusView) -> String {
    let mut out = format!(
        "Job {}\n  Status:   {}\n  Progress: {}\n  Message:  {}",
        view.job_id,
        view.status,
        format_progress_bar(view.progress),
        view.message
    );
    if let Some(step) = view.current_step {
        out.push_str(&format!("\n  Step:     {}", step.as_str()));
    }
    if let Some(error) = &view.error {
        out.push_str(&format!("\n  Error:    {}", error));
    }
    if let Some(files) = &view.output_files {
        out.push_str("\n  Outputs:");
        for (kind, path) in files {
            out.push_str(&format!("\n    {:<9} {}", kind.as_str(), path));
        }
    }
    out
}

async fn fetch_status(
    client: &Client,
    host: &str,
    port: u16,
    job: &str,
) -> anyhow::Result<JobStatusView> {
    let url = format!("{}/status/{}", base_url(host, port), job);
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))
}

/// avatar-forge submit
pub async fn cmd_submit(
    host: &str,
    port: u16,
    image: &Path,
    wait: bool,
    interval: u64,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(image)
        .await
        .with_context(|| format!("Failed to read {}", image.display()))?;
    let filename = image
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.jpg")
        .to_string();

    let form = Form::new().part("file", Part::bytes(bytes).file_name(filename));
    let client = Client::new();
    let url = format!("{}/upload", base_url(host, port));
    let response = client
        .post(&url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;
    let job_id = body["job_id"].as_str().unwrap_or("unknown").to_string();

    println!("{}", body["message"].as_str().unwrap_or("Photo uploaded."));
    println!("  Job ID: {}", job_id);

    if !wait {
        println!("Check progress with: avatar-forge status {}", job_id);
        return Ok(());
    }

    let interval = Duration::from_secs(interval.max(1));
    let mut last_message = String::new();
    loop {
        let view = fetch_status(&client, host, port, &job_id).await?;
        if view.message != last_message {
            println!("{} {}", format_progress_bar(view.progress), view.message);
            last_message = view.message.clone();
        }
        if view.status.is_terminal() {
            println!();
            println!("{}", format_status(&view));
            if let Some(error) = view.error {
                anyhow::bail!("Job failed: {}", error);
            }
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

/// avatar-forge status
pub async fn cmd_status(host: &str, port: u16, job: &str, json: bool) -> anyhow::Result<()> {
    let view = fetch_status(&Client::new(), host, port, job).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!("{}", format_status(&view));
    }
    Ok(())
}

/// avatar-forge download
pub async fn cmd_download(
    host: &str,
    port: u16,
    job: &str,
    kind: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let kind: ArtifactKind = kind.parse()?;
    let url = format!("{}/download/{}/{}", base_url(host, port), job, kind.as_str());
    let response = Client::new()
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    let dest: PathBuf = match output {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(
            response
                .headers()
                .get(reqwest::header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(filename_from_disposition)
                .unwrap_or_else(|| format!("{}_{}", kind.as_str(), job)),
        ),
    };
    let bytes = response
        .bytes()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read download: {}", e))?;
    tokio::fs::write(&dest, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", dest.display()))?;
    println!("Saved {} ({} bytes) to {}", kind.label(), bytes.len(), dest.display());
    Ok(())
}

/// Extract `name` from `attachment; filename="name"`, keeping only the final
/// path component.
fn filename_from_disposition(value: &str) -> Option<String> {
    let raw = value.split("filename=").nth(1)?.trim().trim_matches('"');
    let name = Path::new(raw).file_name()?.to_str()?.to_string();
    (!name.is_empty()).then_some(name)
}

/// avatar-forge profiles
pub fn cmd_profiles() {
    println!(
        "{:<10} {:<26} {:<18} {:>10}",
        "KEY", "NAME", "BED (mm)", "MAX HEIGHT"
    );
    for profile in printer::list() {
        let [x, y, z] = profile.bed_size;
        println!(
            "{:<10} {:<26} {:<18} {:>8}mm",
            profile.key,
            profile.name,
            format!("{}x{}x{}", x, y, z),
            profile.max_model_height
        );
    }
}
