// Stage adapters: each wraps one slow collaborator behind the same contract.

pub mod cartoon;
pub mod face;
pub mod generate;
pub mod mock;
pub mod optimize;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::ForgeError;
use crate::models::{Stage, StageOutcome};

/// What a stage gets to work with: the job and the previous stage's artifact
/// (the upload, for the first stage).
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: Uuid,
    pub input: PathBuf,
}

/// Trait for one pipeline stage. Expected failures (no face, remote task
/// failed, timeout) come back as `StageOutcome::failed`; `Err` is reserved
/// for faults and is turned into a failed outcome by the orchestrator.
#[async_trait]
pub trait StageAdapter: Send + Sync {
    fn stage(&self) -> Stage;
    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageOutcome>;
}

/// The four adapters in their fixed execution order.
#[derive(Clone)]
pub struct StageSet {
    adapters: [Arc<dyn StageAdapter>; 4],
}

impl StageSet {
    pub fn new(
        face: Arc<dyn StageAdapter>,
        cartoon: Arc<dyn StageAdapter>,
        generate: Arc<dyn StageAdapter>,
        optimize: Arc<dyn StageAdapter>,
    ) -> Result<Self, ForgeError> {
        let adapters = [face, cartoon, generate, optimize];
        for (adapter, expected) in adapters.iter().zip(Stage::ALL) {
            if adapter.stage() != expected {
                return Err(ForgeError::Config(format!(
                    "adapter for {} registered in the {} slot",
                    adapter.stage(),
                    expected
                )));
            }
        }
        Ok(Self { adapters })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn StageAdapter>> {
        self.adapters.iter()
    }
}
