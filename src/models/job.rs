use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ForgeError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the four ordered transformations a job passes through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    #[serde(rename = "face_detection")]
    FaceDetection,
    #[serde(rename = "cartoonization")]
    Cartoonization,
    #[serde(rename = "3d_generation")]
    Generation3D,
    #[serde(rename = "optimization")]
    Optimization,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::FaceDetection,
        Stage::Cartoonization,
        Stage::Generation3D,
        Stage::Optimization,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::FaceDetection => "face_detection",
            Stage::Cartoonization => "cartoonization",
            Stage::Generation3D => "3d_generation",
            Stage::Optimization => "optimization",
        }
    }

    /// Reported progress while this stage is running.
    pub fn progress(self) -> u8 {
        match self {
            Stage::FaceDetection => 10,
            Stage::Cartoonization => 30,
            Stage::Generation3D => 60,
            Stage::Optimization => 85,
        }
    }

    pub fn starting_message(self) -> &'static str {
        match self {
            Stage::FaceDetection => "Detecting face...",
            Stage::Cartoonization => "Creating cartoon portrait (30-60s)...",
            Stage::Generation3D => "Generating 3D model (2-3 minutes)...",
            Stage::Optimization => "Optimizing mesh for printing...",
        }
    }

    pub fn done_message(self) -> &'static str {
        match self {
            Stage::FaceDetection => "Face detected successfully!",
            Stage::Cartoonization => "Cartoonization complete!",
            Stage::Generation3D => "3D model generated!",
            Stage::Optimization => "Mesh optimized!",
        }
    }

    /// The output kind this stage contributes to a completed job.
    /// Face detection passes its input through and contributes nothing.
    pub fn artifact_kind(self) -> Option<ArtifactKind> {
        match self {
            Stage::FaceDetection => None,
            Stage::Cartoonization => Some(ArtifactKind::Cartoon),
            Stage::Generation3D => Some(ArtifactKind::Model3d),
            Stage::Optimization => Some(ArtifactKind::Stl),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PipelineStep {
    #[serde(rename = "face_detection")]
    FaceDetection,
    #[serde(rename = "cartoonization")]
    Cartoonization,
    #[serde(rename = "3d_generation")]
    Generation3D,
    #[serde(rename = "optimization")]
    Optimization,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl PipelineStep {
    /// Ordering used to keep `current_step` moving forward. Both terminal
    /// steps share the highest rank.
    fn rank(self) -> u8 {
        match self {
            PipelineStep::FaceDetection => 1,
            PipelineStep::Cartoonization => 2,
            PipelineStep::Generation3D => 3,
            PipelineStep::Optimization => 4,
            PipelineStep::Completed | PipelineStep::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStep::Completed | PipelineStep::Failed)
    }

    pub fn stage(self) -> Option<Stage> {
        match self {
            PipelineStep::FaceDetection => Some(Stage::FaceDetection),
            PipelineStep::Cartoonization => Some(Stage::Cartoonization),
            PipelineStep::Generation3D => Some(Stage::Generation3D),
            PipelineStep::Optimization => Some(Stage::Optimization),
            PipelineStep::Completed | PipelineStep::Failed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self.stage() {
            Some(stage) => stage.as_str(),
            None if self == PipelineStep::Completed => "completed",
            None => "failed",
        }
    }
}

impl From<Stage> for PipelineStep {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::FaceDetection => PipelineStep::FaceDetection,
            Stage::Cartoonization => PipelineStep::Cartoonization,
            Stage::Generation3D => PipelineStep::Generation3D,
            Stage::Optimization => PipelineStep::Optimization,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    #[serde(rename = "cartoon")]
    Cartoon,
    #[serde(rename = "model_3d")]
    Model3d,
    #[serde(rename = "stl")]
    Stl,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Cartoon, ArtifactKind::Model3d, ArtifactKind::Stl];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Cartoon => "cartoon",
            ArtifactKind::Model3d => "model_3d",
            ArtifactKind::Stl => "stl",
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            ArtifactKind::Cartoon => "image/png",
            ArtifactKind::Model3d => "model/gltf-binary",
            ArtifactKind::Stl => "application/sla",
        }
    }

    /// File name offered to clients downloading this artifact.
    pub fn download_name(self, job_id: Uuid) -> String {
        match self {
            ArtifactKind::Cartoon => format!("cartoon_{}.png", job_id),
            ArtifactKind::Model3d => format!("avatar_{}.glb", job_id),
            ArtifactKind::Stl => format!("avatar_{}.stl", job_id),
        }
    }

    /// Human-readable label used in "not found" messages.
    pub fn label(self) -> &'static str {
        match self {
            ArtifactKind::Cartoon => "Cartoon image",
            ArtifactKind::Model3d => "GLB file",
            ArtifactKind::Stl => "STL file",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cartoon" => Ok(ArtifactKind::Cartoon),
            "model_3d" | "model3d" | "glb" => Ok(ArtifactKind::Model3d),
            "stl" => Ok(ArtifactKind::Stl),
            other => Err(ForgeError::InvalidInput(format!(
                "Unknown artifact kind '{}'. Expected one of: cartoon, model_3d, stl",
                other
            ))),
        }
    }
}

/// Observability record for one executed stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub success: bool,
    pub message: String,
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub current_step: Option<PipelineStep>,
    pub last_message: Option<String>,
    pub input: PathBuf,
    pub original_filename: String,
    #[serde(default)]
    pub outputs: BTreeMap<ArtifactKind, PathBuf>,
    pub error: Option<String>,
    pub failed_step: Option<Stage>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_duration_secs: Option<f64>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

/// Fixed progress table. Failed jobs report 0; the step they failed on is
/// kept in `failed_step`.
pub fn progress_for(status: JobStatus, step: Option<PipelineStep>) -> u8 {
    match status {
        JobStatus::Completed => 100,
        JobStatus::Failed => 0,
        JobStatus::Pending | JobStatus::Processing => match step.and_then(PipelineStep::stage) {
            Some(stage) => stage.progress(),
            None => 0,
        },
    }
}

impl Job {
    /// A freshly submitted job in the Pending state.
    pub fn new(id: Uuid, input: PathBuf, original_filename: String) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            current_step: None,
            last_message: None,
            input,
            original_filename,
            outputs: BTreeMap::new(),
            error: None,
            failed_step: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_duration_secs: None,
            steps: Vec::new(),
        }
    }

    pub fn progress(&self) -> u8 {
        progress_for(self.status, self.current_step)
    }

    fn transition_error(&self, action: &str) -> ForgeError {
        ForgeError::InvalidTransition(format!(
            "job {} cannot {} while {} (step: {})",
            self.id,
            action,
            self.status,
            self.current_step.map(PipelineStep::as_str).unwrap_or("none")
        ))
    }

    /// Pending -> Processing.
    pub fn start_processing(&mut self) -> Result<(), ForgeError> {
        if self.status != JobStatus::Pending {
            return Err(self.transition_error("start processing"));
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
        self.last_message = Some("Processing started".to_string());
        Ok(())
    }

    /// Move `current_step` forward to `stage`.
    pub fn enter_stage(&mut self, stage: Stage) -> Result<(), ForgeError> {
        if self.status != JobStatus::Processing {
            return Err(self.transition_error(&format!("enter {}", stage)));
        }
        let next = PipelineStep::from(stage);
        if let Some(current) = self.current_step {
            if next.rank() <= current.rank() {
                return Err(self.transition_error(&format!("enter {}", stage)));
            }
        }
        self.current_step = Some(next);
        self.last_message = Some(stage.starting_message().to_string());
        Ok(())
    }

    /// Append the step log entry for the stage currently running.
    pub fn record_step(&mut self, record: StepRecord) -> Result<(), ForgeError> {
        if self.status != JobStatus::Processing
            || self.current_step != Some(PipelineStep::from(record.stage))
        {
            return Err(self.transition_error(&format!("record {}", record.stage)));
        }
        if record.success {
            self.last_message = Some(record.stage.done_message().to_string());
        }
        self.steps.push(record);
        Ok(())
    }

    /// Processing -> Completed. Requires the final stage to have run and
    /// every output kind to be present.
    pub fn complete(
        &mut self,
        outputs: BTreeMap<ArtifactKind, PathBuf>,
        total_duration_secs: f64,
    ) -> Result<(), ForgeError> {
        if self.status != JobStatus::Processing
            || self.current_step != Some(PipelineStep::Optimization)
        {
            return Err(self.transition_error("complete"));
        }
        if let Some(missing) = ArtifactKind::ALL.iter().find(|k| !outputs.contains_key(k)) {
            return Err(ForgeError::InvalidTransition(format!(
                "job {} cannot complete without a {} output",
                self.id, missing
            )));
        }
        self.status = JobStatus::Completed;
        self.current_step = Some(PipelineStep::Completed);
        self.outputs = outputs;
        self.error = None;
        self.last_message = Some("Avatar ready for printing!".to_string());
        self.finished_at = Some(Utc::now());
        self.total_duration_secs = Some(total_duration_secs);
        Ok(())
    }

    /// Processing -> Failed. Outputs are never exposed on a failed job.
    pub fn fail(
        &mut self,
        stage: Option<Stage>,
        error: String,
        total_duration_secs: f64,
    ) -> Result<(), ForgeError> {
        if self.status != JobStatus::Processing {
            return Err(self.transition_error("fail"));
        }
        self.status = JobStatus::Failed;
        self.current_step = Some(PipelineStep::Failed);
        self.failed_step = stage;
        self.outputs.clear();
        self.last_message = Some(error.clone());
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
        self.total_duration_secs = Some(total_duration_secs);
        Ok(())
    }
}

/// Response body of the status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub current_step: Option<PipelineStep>,
    pub output_files: Option<BTreeMap<ArtifactKind, String>>,
    pub error: Option<String>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        let output_files = if job.outputs.is_empty() {
            None
        } else {
            Some(
                job.outputs
                    .iter()
                    .map(|(kind, path)| (*kind, path.display().to_string()))
                    .collect(),
            )
        };
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress(),
            message: job
                .last_message
                .clone()
                .unwrap_or_else(|| format!("Status: {}", job.status)),
            current_step: job.current_step,
            output_files,
            error: job.error.clone(),
        }
    }
}

/// Response body of a successful submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub message: String,
    pub status: JobStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job() -> Job {
        Job::new(
            Uuid::now_v7(),
            PathBuf::from("uploads/a.png"),
            "a.png".to_string(),
        )
    }

    fn step(stage: Stage, success: bool) -> StepRecord {
        StepRecord {
            stage,
            started_at: Utc::now(),
            duration_secs: 0.5,
            success,
            message: "ok".to_string(),
            artifact: None,
            metrics: serde_json::Map::new(),
        }
    }

    fn all_outputs() -> BTreeMap<ArtifactKind, PathBuf> {
        ArtifactKind::ALL
            .iter()
            .map(|k| (*k, PathBuf::from(format!("out.{}", k))))
            .collect()
    }

    fn run_to_optimization(job: &mut Job) {
        job.start_processing().expect("start");
        for stage in Stage::ALL {
            job.enter_stage(stage).expect("enter");
            job.record_step(step(stage, true)).expect("record");
        }
    }

    #[test]
    fn test_new_job_is_pending_with_zero_progress() {
        let job = make_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.current_step.is_none());
        assert_eq!(job.progress(), 0);
        assert!(job.outputs.is_empty());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_progress_table() {
        assert_eq!(progress_for(JobStatus::Pending, None), 0);
        assert_eq!(progress_for(JobStatus::Processing, None), 0);
        assert_eq!(
            progress_for(JobStatus::Processing, Some(PipelineStep::FaceDetection)),
            10
        );
        assert_eq!(
            progress_for(JobStatus::Processing, Some(PipelineStep::Cartoonization)),
            30
        );
        assert_eq!(
            progress_for(JobStatus::Processing, Some(PipelineStep::Generation3D)),
            60
        );
        assert_eq!(
            progress_for(JobStatus::Processing, Some(PipelineStep::Optimization)),
            85
        );
        assert_eq!(
            progress_for(JobStatus::Completed, Some(PipelineStep::Completed)),
            100
        );
        assert_eq!(progress_for(JobStatus::Failed, Some(PipelineStep::Failed)), 0);
    }

    #[test]
    fn test_full_lifecycle_to_completed() {
        let mut job = make_job();
        run_to_optimization(&mut job);
        assert_eq!(job.progress(), 85);
        assert_eq!(job.last_message.as_deref(), Some("Mesh optimized!"));

        job.complete(all_outputs(), 12.5).expect("complete");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.current_step, Some(PipelineStep::Completed));
        assert_eq!(job.progress(), 100);
        assert_eq!(job.outputs.len(), 3);
        assert!(job.error.is_none());
        assert_eq!(job.steps.len(), 4);
        assert_eq!(job.total_duration_secs, Some(12.5));
    }

    #[test]
    fn test_start_processing_twice_is_rejected() {
        let mut job = make_job();
        job.start_processing().expect("start");
        let err = job.start_processing().unwrap_err();
        assert!(matches!(err, ForgeError::InvalidTransition(_)));
    }

    #[test]
    fn test_enter_stage_requires_processing() {
        let mut job = make_job();
        let err = job.enter_stage(Stage::FaceDetection).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidTransition(_)));
    }

    #[test]
    fn test_enter_stage_never_regresses() {
        let mut job = make_job();
        job.start_processing().expect("start");
        job.enter_stage(Stage::FaceDetection).expect("face");
        job.enter_stage(Stage::Cartoonization).expect("cartoon");
        assert!(job.enter_stage(Stage::FaceDetection).is_err());
        assert!(job.enter_stage(Stage::Cartoonization).is_err());
        assert_eq!(job.current_step, Some(PipelineStep::Cartoonization));
    }

    #[test]
    fn test_record_step_must_match_current_stage() {
        let mut job = make_job();
        job.start_processing().expect("start");
        job.enter_stage(Stage::FaceDetection).expect("face");
        assert!(job.record_step(step(Stage::Generation3D, true)).is_err());
        assert!(job.steps.is_empty());
    }

    #[test]
    fn test_complete_requires_all_outputs() {
        let mut job = make_job();
        run_to_optimization(&mut job);
        let mut outputs = all_outputs();
        outputs.remove(&ArtifactKind::Stl);
        assert!(job.complete(outputs, 1.0).is_err());
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn test_complete_before_last_stage_is_rejected() {
        let mut job = make_job();
        job.start_processing().expect("start");
        job.enter_stage(Stage::FaceDetection).expect("face");
        assert!(job.complete(all_outputs(), 1.0).is_err());
    }

    #[test]
    fn test_fail_sets_error_and_clears_outputs() {
        let mut job = make_job();
        job.start_processing().expect("start");
        job.enter_stage(Stage::FaceDetection).expect("face");
        job.fail(
            Some(Stage::FaceDetection),
            "No face detected".to_string(),
            0.2,
        )
        .expect("fail");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.current_step, Some(PipelineStep::Failed));
        assert_eq!(job.failed_step, Some(Stage::FaceDetection));
        assert_eq!(job.error.as_deref(), Some("No face detected"));
        assert!(job.outputs.is_empty());
        assert_eq!(job.progress(), 0);
    }

    #[test]
    fn test_terminal_states_never_transition() {
        let mut completed = make_job();
        run_to_optimization(&mut completed);
        completed.complete(all_outputs(), 1.0).expect("complete");
        assert!(completed.fail(None, "late".to_string(), 1.0).is_err());
        assert!(completed.start_processing().is_err());
        assert!(completed.enter_stage(Stage::Optimization).is_err());

        let mut failed = make_job();
        failed.start_processing().expect("start");
        failed.fail(None, "boom".to_string(), 0.0).expect("fail");
        assert!(failed.complete(all_outputs(), 1.0).is_err());
        assert!(failed.fail(None, "again".to_string(), 0.0).is_err());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_pipeline_step_wire_names() {
        let cases = [
            (PipelineStep::FaceDetection, "\"face_detection\""),
            (PipelineStep::Cartoonization, "\"cartoonization\""),
            (PipelineStep::Generation3D, "\"3d_generation\""),
            (PipelineStep::Optimization, "\"optimization\""),
            (PipelineStep::Completed, "\"completed\""),
            (PipelineStep::Failed, "\"failed\""),
        ];
        for (step, expected) in cases {
            assert_eq!(serde_json::to_string(&step).unwrap(), expected);
            assert_eq!(format!("\"{}\"", step.as_str()), expected);
        }
    }

    #[test]
    fn test_artifact_kind_parse_and_names() {
        assert_eq!("stl".parse::<ArtifactKind>().unwrap(), ArtifactKind::Stl);
        assert_eq!(
            "cartoon".parse::<ArtifactKind>().unwrap(),
            ArtifactKind::Cartoon
        );
        assert_eq!(
            "model_3d".parse::<ArtifactKind>().unwrap(),
            ArtifactKind::Model3d
        );
        assert!("obj".parse::<ArtifactKind>().is_err());

        let id = Uuid::nil();
        assert_eq!(
            ArtifactKind::Stl.download_name(id),
            format!("avatar_{}.stl", id)
        );
        assert_eq!(ArtifactKind::Model3d.media_type(), "model/gltf-binary");
    }

    #[test]
    fn test_status_view_defaults_message() {
        let job = make_job();
        let view = JobStatusView::from(&job);
        assert_eq!(view.message, "Status: pending");
        assert_eq!(view.progress, 0);
        assert!(view.output_files.is_none());
        assert!(view.error.is_none());
    }

    #[test]
    fn test_status_view_of_completed_job() {
        let mut job = make_job();
        run_to_optimization(&mut job);
        job.complete(all_outputs(), 3.0).expect("complete");
        let view = JobStatusView::from(&job);
        let json = serde_json::to_value(&view).expect("serialize");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["progress"], 100);
        assert_eq!(json["current_step"], "completed");
        assert!(json["output_files"]["stl"].is_string());
        assert!(json["output_files"]["model_3d"].is_string());
        assert!(json["output_files"]["cartoon"].is_string());
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_job_serde_roundtrip() {
        let mut job = make_job();
        job.start_processing().expect("start");
        job.enter_stage(Stage::FaceDetection).expect("face");
        let json = serde_json::to_string(&job).expect("serialize");
        let back: Job = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(job, back);
    }
}
