use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::{ArtifactKind, JobStatus, Stage, StageOutcome, StepRecord};
use crate::pipeline::events::{PipelineEvent, PipelineObserver};
use crate::stages::{StageAdapter, StageContext, StageSet};
use crate::storage::{mutation, JobStore};

/// Drives one job through the four stages, writing every transition to the
/// job store and reporting it to the observer.
pub struct PipelineOrchestrator {
    store: Arc<dyn JobStore>,
    stages: StageSet,
    observer: Arc<dyn PipelineObserver>,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        stages: StageSet,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            store,
            stages,
            observer,
        }
    }

    /// Run the pipeline to a terminal state. Stage failures, adapter faults
    /// and panics anywhere in the run (observer, store) end up on the job
    /// record, never as an error or panic of this call.
    pub async fn run(&self, job_id: Uuid, input: PathBuf) {
        let started = Instant::now();
        if let Err(panic) = AssertUnwindSafe(self.drive(job_id, input, started))
            .catch_unwind()
            .await
        {
            let error = format!("Pipeline error: {}", panic_message(panic.as_ref()));
            tracing::error!("Job {} pipeline task panicked: {}", job_id, error);
            self.fail_after_panic(job_id, error, started).await;
        }
    }

    async fn drive(&self, job_id: Uuid, input: PathBuf, started: Instant) {
        if let Err(e) = self
            .store
            .mutate(job_id, mutation(|j| j.start_processing()))
            .await
        {
            tracing::error!("Job {} could not start processing: {:#}", job_id, e);
            return;
        }
        tracing::info!("Job {} processing started", job_id);

        let mut current_input = input;
        let mut outputs: BTreeMap<ArtifactKind, PathBuf> = BTreeMap::new();

        for adapter in self.stages.iter() {
            let stage = adapter.stage();

            if let Err(e) = self
                .store
                .mutate(job_id, mutation(move |j| j.enter_stage(stage)))
                .await
            {
                self.fail_job(job_id, Some(stage), format!("Pipeline error: {:#}", e), started)
                    .await;
                return;
            }
            self.observer.on_event(&PipelineEvent::StageStarted {
                job_id,
                stage,
                message: stage.starting_message().to_string(),
                progress: stage.progress(),
                timestamp: Utc::now(),
            });
            tracing::info!("Job {} [{}] {}", job_id, stage, stage.starting_message());

            let stage_started_at = Utc::now();
            let stage_clock = Instant::now();
            let ctx = StageContext {
                job_id,
                input: current_input.clone(),
            };
            let outcome = invoke(adapter.as_ref(), &ctx).await;
            let duration_secs = stage_clock.elapsed().as_secs_f64();

            let record = StepRecord {
                stage,
                started_at: stage_started_at,
                duration_secs,
                success: outcome.success,
                message: outcome.message.clone(),
                artifact: outcome.artifact.clone(),
                metrics: outcome.metrics.clone(),
            };

            let artifact = match (outcome.success, outcome.artifact) {
                (true, Some(artifact)) => artifact,
                (success, _) => {
                    let error = if success {
                        format!("Pipeline error: {} reported success without an artifact", stage)
                    } else {
                        outcome.message
                    };
                    self.fail_stage(job_id, stage, record, error, started).await;
                    return;
                }
            };

            if let Err(e) = self
                .store
                .mutate(job_id, mutation(move |j| j.record_step(record)))
                .await
            {
                self.fail_job(job_id, Some(stage), format!("Pipeline error: {:#}", e), started)
                    .await;
                return;
            }
            self.observer.on_event(&PipelineEvent::StageCompleted {
                job_id,
                stage,
                message: stage.done_message().to_string(),
                artifact: Some(artifact.clone()),
                duration_secs,
                timestamp: Utc::now(),
            });
            tracing::info!(
                "Job {} [{}] completed in {:.1}s: {}",
                job_id,
                stage,
                duration_secs,
                artifact.display()
            );

            if let Some(kind) = stage.artifact_kind() {
                outputs.insert(kind, artifact.clone());
            }
            current_input = artifact;
        }

        let total = started.elapsed().as_secs_f64();
        let kinds: Vec<ArtifactKind> = outputs.keys().copied().collect();
        match self
            .store
            .mutate(job_id, mutation(move |j| j.complete(outputs, total)))
            .await
        {
            Ok(_) => {
                tracing::info!("Job {} completed in {:.1}s", job_id, total);
                self.observer.on_event(&PipelineEvent::JobCompleted {
                    job_id,
                    outputs: kinds,
                    total_duration_secs: total,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                self.fail_job(job_id, None, format!("Pipeline error: {:#}", e), started)
                    .await;
            }
        }
    }

    /// A stage reported failure: keep its step record, then fail the job.
    async fn fail_stage(
        &self,
        job_id: Uuid,
        stage: Stage,
        record: StepRecord,
        error: String,
        started: Instant,
    ) {
        let total = started.elapsed().as_secs_f64();
        let message = error.clone();
        let result = self
            .store
            .mutate(
                job_id,
                mutation(move |j| {
                    j.record_step(record)?;
                    j.fail(Some(stage), message, total)
                }),
            )
            .await;

        match result {
            Ok(_) => self.notify_failed(job_id, Some(stage), error),
            Err(e) => {
                tracing::warn!(
                    "Job {} could not record failed {} step: {:#}",
                    job_id,
                    stage,
                    e
                );
                self.fail_job(job_id, Some(stage), error, started).await;
            }
        }
    }

    async fn fail_job(&self, job_id: Uuid, stage: Option<Stage>, error: String, started: Instant) {
        let total = started.elapsed().as_secs_f64();
        let message = error.clone();
        match self
            .store
            .mutate(job_id, mutation(move |j| j.fail(stage, message, total)))
            .await
        {
            Ok(_) => self.notify_failed(job_id, stage, error),
            Err(e) => {
                tracing::error!(
                    "Job {} could not be marked failed ({}): {:#}",
                    job_id,
                    error,
                    e
                );
            }
        }
    }

    /// Fail whatever state the job was left in. A job that already reached a
    /// terminal state keeps it.
    async fn fail_after_panic(&self, job_id: Uuid, error: String, started: Instant) {
        let total = started.elapsed().as_secs_f64();
        let message = error.clone();
        let result = self
            .store
            .mutate(
                job_id,
                mutation(move |j| {
                    if j.status == JobStatus::Pending {
                        j.start_processing()?;
                    }
                    let stage = j.current_step.and_then(|s| s.stage());
                    j.fail(stage, message, total)
                }),
            )
            .await;
        match result {
            Ok(job) => {
                let stage = job.failed_step;
                let notify = AssertUnwindSafe(|| self.notify_failed(job_id, stage, error));
                if std::panic::catch_unwind(notify).is_err() {
                    tracing::error!("Job {} observer panicked while reporting the failure", job_id);
                }
            }
            Err(e) => tracing::warn!("Job {} left as is after panic: {:#}", job_id, e),
        }
    }

    fn notify_failed(&self, job_id: Uuid, stage: Option<Stage>, error: String) {
        match stage {
            Some(stage) => tracing::warn!("Job {} failed at {}: {}", job_id, stage, error),
            None => tracing::warn!("Job {} failed: {}", job_id, error),
        }
        if let Some(stage) = stage {
            self.observer.on_event(&PipelineEvent::StageFailed {
                job_id,
                stage,
                error: error.clone(),
                timestamp: Utc::now(),
            });
        }
        self.observer.on_event(&PipelineEvent::JobFailed {
            job_id,
            error,
            timestamp: Utc::now(),
        });
    }
}

/// Call the adapter, turning an `Err` or a panic into a failed outcome.
async fn invoke(adapter: &dyn StageAdapter, ctx: &StageContext) -> StageOutcome {
    match AssertUnwindSafe(adapter.execute(ctx)).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => StageOutcome::failed(format!("Pipeline error: {:#}", e)),
        Err(panic) => StageOutcome::failed(format!(
            "Pipeline error: {}",
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "stage panicked".to_string()
    }
}
