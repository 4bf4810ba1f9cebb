use std::time::Duration;

use async_trait::async_trait;

use crate::models::{ArtifactKind, Stage, StageOutcome};
use crate::pipeline::polling::{PollingWaiter, WaitError};
use crate::providers::download;
use crate::providers::meshy::MeshyClient;
use crate::stages::cartoon::png_data_uri;
use crate::stages::{StageAdapter, StageContext};
use crate::storage::ArtifactStore;

/// Submits the cartoon to the image-to-3D service, waits for the task and
/// downloads the resulting GLB.
pub struct Generate3dAdapter {
    client: MeshyClient,
    waiter: PollingWaiter,
    download_timeout: Duration,
    artifacts: ArtifactStore,
}

impl Generate3dAdapter {
    pub fn new(
        client: MeshyClient,
        waiter: PollingWaiter,
        download_timeout: Duration,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            client,
            waiter,
            download_timeout,
            artifacts,
        }
    }
}

/// Stage message for a failed or expired wait.
pub fn wait_failure_message(err: &WaitError, timeout: Duration) -> String {
    match err {
        WaitError::TimedOut { .. } => {
            format!("3D generation timed out after {}s", timeout.as_secs())
        }
        WaitError::RemoteFailed(reason) => reason.clone(),
    }
}

#[async_trait]
impl StageAdapter for Generate3dAdapter {
    fn stage(&self) -> Stage {
        Stage::Generation3D
    }

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageOutcome> {
        let image = tokio::fs::read(&ctx.input).await?;
        let task_id = match self.client.create_task(&png_data_uri(&image)).await {
            Ok(id) => id,
            Err(e) => return Ok(StageOutcome::failed(format!("Task creation failed: {}", e))),
        };
        tracing::info!("Job {}: 3D task {} created", ctx.job_id, task_id);

        let client = &self.client;
        let id = task_id.as_str();
        let glb_url = match self.waiter.wait(move || client.check(id)).await {
            Ok(url) => url,
            Err(e) => {
                let message = wait_failure_message(&e, self.waiter.timeout());
                let outcome = StageOutcome::failed(message).with_metric("task_id", task_id.as_str());
                return Ok(match e {
                    WaitError::TimedOut { attempts, .. } => outcome.with_metric("polls", attempts),
                    WaitError::RemoteFailed(_) => outcome,
                });
            }
        };

        let dest = self.artifacts.output_path(ctx.job_id, ArtifactKind::Model3d);
        let size = match download(&glb_url, &dest, self.download_timeout).await {
            Ok(size) => size,
            Err(e) => {
                return Ok(StageOutcome::failed(format!("Failed to download model: {}", e))
                    .with_metric("task_id", task_id.as_str()))
            }
        };

        Ok(StageOutcome::succeeded("3D model generated successfully", dest)
            .with_metric("task_id", task_id.as_str())
            .with_metric("model_bytes", size))
    }
}
