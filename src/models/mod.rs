pub mod config;
pub mod job;
pub mod outcome;
pub mod printer;

pub use config::ServiceConfig;
pub use job::{
    ArtifactKind, Job, JobStatus, JobStatusView, PipelineStep, Stage, StepRecord, SubmitReceipt,
};
pub use outcome::StageOutcome;
pub use printer::PrinterProfile;
