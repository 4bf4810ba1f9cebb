use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::errors::ForgeError;
use crate::models::Job;
use crate::storage::{JobMutation, JobStore};

/// Process-lifetime job registry. Each job sits behind its own lock so
/// writers to different jobs only share the map's read lock.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<Job>>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: Uuid) -> Option<Arc<Mutex<Job>>> {
        self.jobs.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(ForgeError::Conflict(format!("Job with id '{}' already exists", job.id)).into());
        }
        jobs.insert(job.id, Arc::new(Mutex::new(job.clone())));
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        match self.entry(id).await {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn mutate(&self, id: Uuid, mutation: JobMutation) -> Result<Job> {
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| ForgeError::NotFound(format!("Job with id '{}' not found", id)))?;

        let mut guard = entry.lock().await;
        let mut draft = guard.clone();
        mutation(&mut draft)?;
        *guard = draft.clone();
        Ok(draft)
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let entries: Vec<Arc<Mutex<Job>>> = self.jobs.read().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            jobs.push(entry.lock().await.clone());
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
