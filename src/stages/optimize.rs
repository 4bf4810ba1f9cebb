use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::mesh::{self, glb, stl, MeshOptions, MeshStats};
use crate::models::printer::PrinterProfile;
use crate::models::{ArtifactKind, Stage, StageOutcome};
use crate::stages::{StageAdapter, StageContext};
use crate::storage::ArtifactStore;

/// Turns the generated GLB into a printable, correctly sized STL.
pub struct OptimizeMeshAdapter {
    profile: &'static PrinterProfile,
    options: MeshOptions,
    artifacts: ArtifactStore,
}

impl OptimizeMeshAdapter {
    pub fn new(profile: &'static PrinterProfile, options: MeshOptions, artifacts: ArtifactStore) -> Self {
        Self {
            profile,
            options,
            artifacts,
        }
    }
}

/// Read, prepare, check against the printer and write the STL. Returns the
/// failure message for anything the caller should report as a stage failure.
pub fn optimize_file(
    input: &Path,
    output: &Path,
    options: &MeshOptions,
    profile: &PrinterProfile,
) -> Result<MeshStats, String> {
    let bytes = std::fs::read(input)
        .map_err(|e| format!("Mesh optimization failed: cannot read {}: {}", input.display(), e))?;
    let mesh = glb::read_glb(&bytes).map_err(|e| format!("Mesh optimization failed: {}", e))?;
    let (mesh, stats) =
        mesh::prepare_for_print(mesh, options).map_err(|e| format!("Mesh optimization failed: {}", e))?;

    profile.validate_model_size(stats.dimensions)?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("Mesh optimization failed: {}", e))?;
    }
    std::fs::write(output, stl::write_binary_stl(&mesh))
        .map_err(|e| format!("Mesh optimization failed: cannot write STL: {}", e))?;
    Ok(stats)
}

#[async_trait]
impl StageAdapter for OptimizeMeshAdapter {
    fn stage(&self) -> Stage {
        Stage::Optimization
    }

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageOutcome> {
        let input = ctx.input.clone();
        let output: PathBuf = self.artifacts.output_path(ctx.job_id, ArtifactKind::Stl);
        let options = self.options.clone();
        let profile = self.profile;

        let dest = output.clone();
        let result =
            tokio::task::spawn_blocking(move || optimize_file(&input, &dest, &options, profile)).await?;

        match result {
            Ok(stats) => {
                tracing::info!(
                    "Job {}: STL ready, {} faces, {:.1}x{:.1}x{:.1}mm",
                    ctx.job_id,
                    stats.face_count,
                    stats.dimensions[0],
                    stats.dimensions[1],
                    stats.dimensions[2]
                );
                let mut outcome = StageOutcome::succeeded("Mesh optimized for printing", output)
                    .with_metric("printer_profile", profile.key);
                if let serde_json::Value::Object(map) = serde_json::to_value(&stats)? {
                    outcome.metrics.extend(map);
                }
                Ok(outcome)
            }
            Err(message) => Ok(StageOutcome::failed(message).with_metric("printer_profile", profile.key)),
        }
    }
}
