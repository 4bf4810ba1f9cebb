use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::ForgeError;
use crate::models::config::ImageConfig;
use crate::models::{ArtifactKind, Job, JobStatus, JobStatusView, SubmitReceipt};
use crate::pipeline::PipelineOrchestrator;
use crate::storage::{mutation, ArtifactStore, JobStore};
use crate::validation::{sanitize_filename, validate_image_file, validate_upload_size};

const SUBMITTED_MESSAGE: &str = "Photo uploaded successfully. Processing started.";

/// A finished artifact ready to be streamed to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFile {
    pub path: PathBuf,
    pub media_type: &'static str,
    pub download_name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Parse a job id from a path segment. Anything that is not a UUID cannot
/// name a job, so it is reported as not found.
pub fn parse_job_id(raw: &str) -> Result<Uuid, ForgeError> {
    Uuid::parse_str(raw).map_err(|_| ForgeError::NotFound("Job not found".to_string()))
}

/// Accepts uploads, owns the job store and keeps track of the background
/// orchestration task of every in-flight job.
pub struct JobService {
    store: Arc<dyn JobStore>,
    orchestrator: Arc<PipelineOrchestrator>,
    artifacts: ArtifactStore,
    max_upload_size_mb: u64,
    image_limits: ImageConfig,
    active: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        orchestrator: PipelineOrchestrator,
        artifacts: ArtifactStore,
        max_upload_size_mb: u64,
        image_limits: ImageConfig,
    ) -> Self {
        Self {
            store,
            orchestrator: Arc::new(orchestrator),
            artifacts,
            max_upload_size_mb,
            image_limits,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Store and validate the upload, create the Pending record and start the
    /// pipeline in the background. Returns as soon as the record exists.
    pub async fn submit(&self, filename: &str, bytes: &[u8]) -> Result<SubmitReceipt, ForgeError> {
        validate_upload_size(bytes.len(), self.max_upload_size_mb)?;

        let job_id = Uuid::now_v7();
        let name = sanitize_filename(filename);
        let path = self
            .artifacts
            .write_upload(job_id, &name, bytes)
            .await
            .map_err(|e| ForgeError::Storage(format!("Upload error: {:#}", e)))?;

        let check_path = path.clone();
        let limits = self.image_limits.clone();
        let checked = tokio::task::spawn_blocking(move || validate_image_file(&check_path, &limits))
            .await
            .map_err(|e| ForgeError::Internal(format!("Upload validation task failed: {}", e)))
            .and_then(|r| r);
        if let Err(e) = checked {
            ArtifactStore::remove(&path).await;
            return Err(e);
        }

        let job = Job::new(job_id, path.clone(), name);
        if let Err(e) = self.store.create(job).await {
            ArtifactStore::remove(&path).await;
            return Err(ForgeError::from_anyhow(e));
        }
        tracing::info!("Job {} accepted ({} bytes)", job_id, bytes.len());

        // Hold the lock across the spawn so the task cannot deregister
        // itself before it is registered.
        let mut active = self.active.write().await;
        let orchestrator = Arc::clone(&self.orchestrator);
        let registry = Arc::clone(&self.active);
        let handle = tokio::spawn(async move {
            if AssertUnwindSafe(orchestrator.run(job_id, path))
                .catch_unwind()
                .await
                .is_err()
            {
                tracing::error!("Job {} orchestration task panicked", job_id);
            }
            registry.write().await.remove(&job_id);
        });
        active.insert(job_id, handle);

        Ok(SubmitReceipt {
            job_id,
            message: SUBMITTED_MESSAGE.to_string(),
            status: JobStatus::Pending,
        })
    }

    async fn job(&self, job_id: Uuid) -> Result<Job, ForgeError> {
        self.store
            .get(job_id)
            .await
            .map_err(ForgeError::from_anyhow)?
            .ok_or_else(|| ForgeError::NotFound("Job not found".to_string()))
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusView, ForgeError> {
        let job = self.job(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    /// Resolve one output of a completed job.
    pub async fn fetch_output(&self, job_id: Uuid, kind: ArtifactKind) -> Result<OutputFile, ForgeError> {
        let job = self.job(job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(ForgeError::NotReady(format!(
                "Job not completed yet (status: {})",
                job.status
            )));
        }
        let missing = || ForgeError::MissingArtifact(format!("{} not found", kind.label()));
        let path = job.outputs.get(&kind).cloned().ok_or_else(missing)?;
        if !ArtifactStore::exists(&path).await {
            return Err(missing());
        }
        Ok(OutputFile {
            path,
            media_type: kind.media_type(),
            download_name: kind.download_name(job_id),
        })
    }

    pub async fn list(&self) -> Result<Vec<Job>, ForgeError> {
        self.store.list().await.map_err(ForgeError::from_anyhow)
    }

    pub async fn counts(&self) -> Result<JobCounts, ForgeError> {
        let mut counts = JobCounts::default();
        for job in self.list().await? {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Number of orchestration tasks still running.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Wait for in-flight jobs. Tasks still running after `grace` are aborted
    /// and their jobs marked failed.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<(Uuid, JoinHandle<()>)> = self.active.write().await.drain().collect();
        if handles.is_empty() {
            return;
        }
        tracing::info!("Waiting up to {}s for {} job(s)", grace.as_secs(), handles.len());

        let deadline = tokio::time::Instant::now() + grace;
        for (job_id, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::info!("Job {} finished before shutdown", job_id),
                Ok(Err(e)) => tracing::warn!("Job {} task failed during shutdown: {}", job_id, e),
                Err(_) => {
                    handle.abort();
                    let _ = handle.await;
                    tracing::warn!("Job {} did not finish within the grace period", job_id);
                    self.mark_interrupted(job_id).await;
                }
            }
        }
    }

    async fn mark_interrupted(&self, job_id: Uuid) {
        let result = self
            .store
            .mutate(
                job_id,
                mutation(|j| {
                    if j.status == JobStatus::Pending {
                        j.start_processing()?;
                    }
                    let stage = j.current_step.and_then(|s| s.stage());
                    j.fail(stage, "Service shutting down".to_string(), 0.0)
                }),
            )
            .await;
        if let Err(e) = result {
            tracing::debug!("Job {} not marked interrupted: {:#}", job_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use crate::pipeline::events::{NoopObserver, PipelineEvent, PipelineObserver};
    use crate::stages::mock::{MockStage, MockStageConfig};
    use crate::stages::StageSet;
    use crate::storage::InMemoryJobStore;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height))
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn service_with(root: &std::path::Path, stages: [MockStage; 4]) -> JobService {
        service_observed(root, stages, Arc::new(NoopObserver))
    }

    fn service_observed(
        root: &std::path::Path,
        stages: [MockStage; 4],
        observer: Arc<dyn PipelineObserver>,
    ) -> JobService {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let [face, cartoon, generate, optimize] = stages;
        let set = StageSet::new(
            Arc::new(face),
            Arc::new(cartoon),
            Arc::new(generate),
            Arc::new(optimize),
        )
        .unwrap();
        let orchestrator = PipelineOrchestrator::new(Arc::clone(&store), set, observer);
        JobService::new(
            store,
            orchestrator,
            ArtifactStore::new(root),
            10,
            ImageConfig {
                min_dimension: 512,
                max_dimension: 4096,
            },
        )
    }

    fn writing_stages(root: &std::path::Path) -> [MockStage; 4] {
        Stage::ALL.map(|s| MockStage::writing_to(s, root.join("out")))
    }

    async fn wait_terminal(service: &JobService, id: Uuid) -> JobStatusView {
        for _ in 0..200 {
            let view = service.status(id).await.unwrap();
            if view.status.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn test_submit_runs_pipeline_to_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service_with(tmp.path(), writing_stages(tmp.path()));

        let receipt = service.submit("me.png", &png_bytes(512, 512)).await.unwrap();
        assert_eq!(receipt.status, JobStatus::Pending);
        assert_eq!(receipt.message, SUBMITTED_MESSAGE);

        let view = wait_terminal(&service, receipt.job_id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100);
        assert_eq!(view.output_files.unwrap().len(), 3);

        let stl = service
            .fetch_output(receipt.job_id, ArtifactKind::Stl)
            .await
            .unwrap();
        assert_eq!(stl.media_type, "application/sla");
        assert_eq!(stl.download_name, format!("avatar_{}.stl", receipt.job_id));
        assert!(stl.path.exists());
    }

    #[tokio::test]
    async fn test_upload_is_stored_under_sanitized_name() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service_with(tmp.path(), writing_stages(tmp.path()));
        let receipt = service
            .submit("my photo.png", &png_bytes(512, 512))
            .await
            .unwrap();
        let expected = tmp
            .path()
            .join("uploads")
            .join(format!("{}_my_photo.png", receipt.job_id));
        assert!(expected.exists());
        wait_terminal(&service, receipt.job_id).await;
    }

    #[tokio::test]
    async fn test_invalid_upload_is_removed_and_no_job_created() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service_with(tmp.path(), writing_stages(tmp.path()));

        let err = service.submit("tiny.png", &png_bytes(100, 100)).await.unwrap_err();
        assert!(matches!(err, ForgeError::InvalidInput(_)));
        assert!(service.list().await.unwrap().is_empty());
        let leftover = std::fs::read_dir(tmp.path().join("uploads")).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service_with(tmp.path(), writing_stages(tmp.path()));
        let big = vec![0u8; 10 * 1024 * 1024 + 200 * 1024];
        let err = service.submit("big.png", &big).await.unwrap_err();
        assert!(matches!(err, ForgeError::PayloadTooLarge(_)));
        assert!(!tmp.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn test_fetch_output_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stages = writing_stages(tmp.path());
        stages[0] = MockStage::failing(Stage::FaceDetection, "No face detected");
        let service = service_with(tmp.path(), stages);

        let unknown = service.fetch_output(Uuid::now_v7(), ArtifactKind::Stl).await;
        assert!(matches!(unknown, Err(ForgeError::NotFound(_))));

        let receipt = service.submit("me.png", &png_bytes(512, 512)).await.unwrap();
        let view = wait_terminal(&service, receipt.job_id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.output_files.is_none());

        let err = service
            .fetch_output(receipt.job_id, ArtifactKind::Stl)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Not ready: Job not completed yet (status: failed)"
        );
    }

    #[tokio::test]
    async fn test_missing_artifact_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service_with(tmp.path(), writing_stages(tmp.path()));
        let receipt = service.submit("me.png", &png_bytes(512, 512)).await.unwrap();
        wait_terminal(&service, receipt.job_id).await;

        let cartoon = service
            .fetch_output(receipt.job_id, ArtifactKind::Cartoon)
            .await
            .unwrap();
        std::fs::remove_file(&cartoon.path).unwrap();
        let err = service
            .fetch_output(receipt.job_id, ArtifactKind::Cartoon)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::MissingArtifact(ref m) if m == "Cartoon image not found"));
    }

    #[tokio::test]
    async fn test_counts_and_active_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service_with(tmp.path(), writing_stages(tmp.path()));
        let a = service.submit("a.png", &png_bytes(512, 512)).await.unwrap();
        let b = service.submit("b.png", &png_bytes(512, 512)).await.unwrap();
        wait_terminal(&service, a.job_id).await;
        wait_terminal(&service, b.job_id).await;

        let counts = service.counts().await.unwrap();
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.pending + counts.processing + counts.failed, 0);

        for _ in 0..100 {
            if service.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(service.active_count().await, 0);
    }

    struct BrokenObserver;

    impl PipelineObserver for BrokenObserver {
        fn on_event(&self, event: &PipelineEvent) {
            if event.event_name() == "stage_started" {
                panic!("event sink unavailable");
            }
        }
    }

    #[tokio::test]
    async fn test_observer_panic_fails_job_and_deregisters_task() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service_observed(
            tmp.path(),
            writing_stages(tmp.path()),
            Arc::new(BrokenObserver),
        );
        let receipt = service.submit("me.png", &png_bytes(512, 512)).await.unwrap();

        let view = wait_terminal(&service, receipt.job_id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(
            view.error.as_deref(),
            Some("Pipeline error: event sink unavailable")
        );

        for _ in 0..100 {
            if service.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(service.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_slow_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stages = writing_stages(tmp.path());
        stages[1] = MockStage::new(
            Stage::Cartoonization,
            MockStageConfig {
                delay: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let service = service_with(tmp.path(), stages);
        let receipt = service.submit("me.png", &png_bytes(512, 512)).await.unwrap();

        service.shutdown(Duration::from_millis(50)).await;

        let view = service.status(receipt.job_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("Service shutting down"));
        assert_eq!(service.active_count().await, 0);
    }

    #[test]
    fn test_parse_job_id() {
        assert!(parse_job_id("not-a-uuid").is_err());
        let id = Uuid::now_v7();
        assert_eq!(parse_job_id(&id.to_string()).unwrap(), id);
    }
}
