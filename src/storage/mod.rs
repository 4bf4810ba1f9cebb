pub mod artifacts;
pub mod jobs;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::ForgeError;
use crate::models::Job;

pub use artifacts::ArtifactStore;
pub use jobs::InMemoryJobStore;

/// A change applied to one job. Returning `Err` discards the change.
pub type JobMutation = Box<dyn FnOnce(&mut Job) -> Result<(), ForgeError> + Send>;

/// Box a closure as a `JobMutation`.
pub fn mutation<F>(f: F) -> JobMutation
where
    F: FnOnce(&mut Job) -> Result<(), ForgeError> + Send + 'static,
{
    Box::new(f)
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `ForgeError::Conflict` if the id is taken.
    async fn create(&self, job: Job) -> Result<Job>;
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;
    /// Apply `mutation` to a copy of the job and commit it only on success.
    /// Fails with `ForgeError::NotFound` for an unknown id, or with the
    /// mutation's own error.
    async fn mutate(&self, id: Uuid, mutation: JobMutation) -> Result<Job>;
    async fn list(&self) -> Result<Vec<Job>>;
}
