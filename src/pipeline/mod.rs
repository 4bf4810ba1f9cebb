pub mod events;
pub mod orchestrator;
pub mod polling;

pub use events::{BroadcastObserver, PipelineEvent, PipelineObserver};
pub use orchestrator::PipelineOrchestrator;
pub use polling::{PollState, PollingWaiter, WaitError};
