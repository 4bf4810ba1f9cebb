// Scripted stage adapters used by the unit and integration test suites.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::models::{Stage, StageOutcome};
use crate::pipeline::polling::{PollState, PollingWaiter, WaitError};
use crate::stages::{StageAdapter, StageContext};

#[derive(Debug, Clone, Default)]
pub enum MockBehavior {
    /// Report success with an artifact.
    #[default]
    Succeed,
    /// Report a structured failure with this message.
    Fail(String),
    /// Return `Err` from `execute`.
    Error(String),
    /// Panic inside `execute`.
    Panic(String),
    /// Report success but with no artifact.
    SucceedWithoutArtifact,
}

/// Configuration for creating a MockStage.
#[derive(Debug, Clone, Default)]
pub struct MockStageConfig {
    pub behavior: MockBehavior,
    /// When set, a small artifact file named `<job>_<stage>.<ext>` is written
    /// here; otherwise the input path is handed back.
    pub output_dir: Option<PathBuf>,
    /// Artifact file name override (e.g. `model.glb`).
    pub artifact_name: Option<String>,
    /// Artifact file contents; a short text marker when unset.
    pub artifact_bytes: Option<Vec<u8>>,
    /// Simulated remote task: this many pending checks before it is ready.
    pub pending_polls: u32,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Sleep before doing anything.
    pub delay: Duration,
    /// When set, the first call waits for a notification before running.
    pub hold_first_call: Option<Arc<Notify>>,
}

/// Mock stage adapter that counts its invocations. The simulated remote
/// task is tracked per job, so concurrent jobs never share progress.
pub struct MockStage {
    stage: Stage,
    config: MockStageConfig,
    calls: Arc<AtomicU32>,
    polls: Arc<AtomicU32>,
    polls_by_job: Arc<Mutex<HashMap<Uuid, u32>>>,
}

impl MockStage {
    pub fn new(stage: Stage, config: MockStageConfig) -> Self {
        Self {
            stage,
            config,
            calls: Arc::new(AtomicU32::new(0)),
            polls: Arc::new(AtomicU32::new(0)),
            polls_by_job: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn succeeding(stage: Stage) -> Self {
        Self::new(stage, MockStageConfig::default())
    }

    pub fn writing_to(stage: Stage, output_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            stage,
            MockStageConfig {
                output_dir: Some(output_dir.into()),
                ..Default::default()
            },
        )
    }

    pub fn failing(stage: Stage, message: &str) -> Self {
        Self::new(
            stage,
            MockStageConfig {
                behavior: MockBehavior::Fail(message.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn erroring(stage: Stage, message: &str) -> Self {
        Self::new(
            stage,
            MockStageConfig {
                behavior: MockBehavior::Error(message.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn panicking(stage: Stage, message: &str) -> Self {
        Self::new(
            stage,
            MockStageConfig {
                behavior: MockBehavior::Panic(message.to_string()),
                ..Default::default()
            },
        )
    }

    /// Number of times `execute` was entered.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of simulated remote status checks, across all jobs.
    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Status checks made for one job.
    pub async fn polls_for(&self, job_id: Uuid) -> u32 {
        self.polls_by_job.lock().await.get(&job_id).copied().unwrap_or(0)
    }

    fn artifact_name(&self, ctx: &StageContext) -> String {
        if let Some(name) = &self.config.artifact_name {
            return format!("{}_{}", ctx.job_id, name);
        }
        let ext = match self.stage {
            Stage::FaceDetection | Stage::Cartoonization => "png",
            Stage::Generation3D => "glb",
            Stage::Optimization => "stl",
        };
        format!("{}_{}.{}", ctx.job_id, self.stage, ext)
    }

    async fn simulate_remote_task(&self, job_id: Uuid) -> Result<(), WaitError> {
        if self.config.pending_polls == 0 {
            return Ok(());
        }
        let interval = if self.config.poll_interval.is_zero() {
            Duration::from_millis(10)
        } else {
            self.config.poll_interval
        };
        let timeout = if self.config.poll_timeout.is_zero() {
            Duration::from_secs(300)
        } else {
            self.config.poll_timeout
        };
        let waiter = PollingWaiter::new(timeout, interval)
            .map_err(|e| WaitError::RemoteFailed(e.to_string()))?;

        let total = self.polls.clone();
        let by_job = self.polls_by_job.clone();
        let pending = self.config.pending_polls;
        waiter
            .wait(|| {
                let total = total.clone();
                let by_job = by_job.clone();
                async move {
                    total.fetch_add(1, Ordering::SeqCst);
                    let n = {
                        let mut counts = by_job.lock().await;
                        let count = counts.entry(job_id).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if n <= pending {
                        PollState::Pending
                    } else {
                        PollState::Ready(())
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl StageAdapter for MockStage {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageOutcome> {
        let previous_calls = self.calls.fetch_add(1, Ordering::SeqCst);

        if let (0, Some(gate)) = (previous_calls, &self.config.hold_first_call) {
            gate.notified().await;
        }

        if !self.config.delay.is_zero() {
            tokio::time::sleep(self.config.delay).await;
        }

        match &self.config.behavior {
            MockBehavior::Fail(message) => return Ok(StageOutcome::failed(message.clone())),
            MockBehavior::Error(message) => return Err(anyhow::anyhow!(message.clone())),
            MockBehavior::Panic(message) => panic!("{}", message),
            MockBehavior::SucceedWithoutArtifact => {
                return Ok(StageOutcome {
                    success: true,
                    message: "done".to_string(),
                    artifact: None,
                    metrics: serde_json::Map::new(),
                })
            }
            MockBehavior::Succeed => {}
        }

        if let Err(e) = self.simulate_remote_task(ctx.job_id).await {
            return Ok(StageOutcome::failed(e.to_string()));
        }

        let artifact = match &self.config.output_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let path = dir.join(self.artifact_name(ctx));
                let contents = match &self.config.artifact_bytes {
                    Some(bytes) => bytes.clone(),
                    None => format!("{} output for {}", self.stage, ctx.job_id).into_bytes(),
                };
                tokio::fs::write(&path, contents).await?;
                path
            }
            None => ctx.input.clone(),
        };

        Ok(StageOutcome::succeeded(self.stage.done_message(), artifact)
            .with_metric("mock", true)
            .with_metric("polls", self.polls_for(ctx.job_id).await))
    }
}
