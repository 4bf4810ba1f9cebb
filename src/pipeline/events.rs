use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ArtifactKind, Stage};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum PipelineEvent {
    StageStarted {
        job_id: Uuid,
        stage: Stage,
        message: String,
        progress: u8,
        timestamp: DateTime<Utc>,
    },
    StageCompleted {
        job_id: Uuid,
        stage: Stage,
        message: String,
        artifact: Option<PathBuf>,
        duration_secs: f64,
        timestamp: DateTime<Utc>,
    },
    StageFailed {
        job_id: Uuid,
        stage: Stage,
        error: String,
        timestamp: DateTime<Utc>,
    },
    JobCompleted {
        job_id: Uuid,
        outputs: Vec<ArtifactKind>,
        total_duration_secs: f64,
        timestamp: DateTime<Utc>,
    },
    JobFailed {
        job_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            PipelineEvent::StageStarted { job_id, .. }
            | PipelineEvent::StageCompleted { job_id, .. }
            | PipelineEvent::StageFailed { job_id, .. }
            | PipelineEvent::JobCompleted { job_id, .. }
            | PipelineEvent::JobFailed { job_id, .. } => *job_id,
        }
    }

    /// Snake-case name used as the SSE event type.
    pub fn event_name(&self) -> &'static str {
        match self {
            PipelineEvent::StageStarted { .. } => "stage_started",
            PipelineEvent::StageCompleted { .. } => "stage_completed",
            PipelineEvent::StageFailed { .. } => "stage_failed",
            PipelineEvent::JobCompleted { .. } => "job_completed",
            PipelineEvent::JobFailed { .. } => "job_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::JobCompleted { .. } | PipelineEvent::JobFailed { .. }
        )
    }
}

/// Receives every lifecycle transition, synchronously, in order.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Forwards events into a broadcast channel for SSE clients and the event
/// logger. Sending with no subscribers is not an error.
#[derive(Clone)]
pub struct BroadcastObserver {
    tx: broadcast::Sender<PipelineEvent>,
}

impl BroadcastObserver {
    pub fn new(tx: broadcast::Sender<PipelineEvent>) -> Self {
        Self { tx }
    }
}

impl PipelineObserver for BroadcastObserver {
    fn on_event(&self, event: &PipelineEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Observer that drops everything.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {
    fn on_event(&self, _event: &PipelineEvent) {}
}
