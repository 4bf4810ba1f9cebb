use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::models::ArtifactKind;

const UPLOADS_DIR: &str = "uploads";
const CARTOON_DIR: &str = "cartoonized";
const MODELS_DIR: &str = "models_3d";
const STL_DIR: &str = "stl_files";

/// File layout for uploads and stage outputs under the data directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [UPLOADS_DIR, CARTOON_DIR, MODELS_DIR, STL_DIR] {
            let path = self.root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("Failed to create directory {}", path.display()))?;
        }
        Ok(())
    }

    /// `uploads/<id>_<name>`; `name` must already be sanitized.
    pub fn upload_path(&self, job_id: Uuid, name: &str) -> PathBuf {
        self.root.join(UPLOADS_DIR).join(format!("{}_{}", job_id, name))
    }

    pub fn output_path(&self, job_id: Uuid, kind: ArtifactKind) -> PathBuf {
        match kind {
            ArtifactKind::Cartoon => self
                .root
                .join(CARTOON_DIR)
                .join(format!("{}_cartoon.png", job_id)),
            ArtifactKind::Model3d => self
                .root
                .join(MODELS_DIR)
                .join(format!("{}_model.glb", job_id)),
            ArtifactKind::Stl => self
                .root
                .join(STL_DIR)
                .join(format!("{}_avatar.stl", job_id)),
        }
    }

    pub async fn write_upload(&self, job_id: Uuid, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.upload_path(job_id, name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write upload {}", path.display()))?;
        Ok(path)
    }

    pub async fn exists(path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Best-effort removal; a missing file is not an error.
    pub async fn remove(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}
