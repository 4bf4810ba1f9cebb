use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

use crate::models::{Stage, StageOutcome};
use crate::providers::landmarks::DetectedFace;
use crate::stages::{StageAdapter, StageContext};

/// Smallest accepted share of the image covered by the face box.
pub const MIN_FACE_RATIO: f64 = 0.05;
/// Largest accepted share of the image covered by the face box.
pub const MAX_FACE_RATIO: f64 = 0.9;

const NO_FACE: &str = "No face detected in image. Please use a clear front-facing portrait.";
const TOO_SMALL: &str = "Face is too small in image. Please use a closer portrait photo.";
const TOO_CLOSE: &str = "Face is too close. Please use a photo with some space around the face.";

/// Source of face landmarks for an image file.
#[async_trait]
pub trait LandmarkDetector: Send + Sync {
    async fn detect(&self, image: &Path) -> anyhow::Result<Vec<DetectedFace>>;
}

/// Checks the upload contains one usable, reasonably framed face. The
/// upload itself is passed on as this stage's artifact.
pub struct FaceCheckAdapter {
    detector: Arc<dyn LandmarkDetector>,
}

impl FaceCheckAdapter {
    pub fn new(detector: Arc<dyn LandmarkDetector>) -> Self {
        Self { detector }
    }
}

/// Judge the first detected face against the image size.
pub fn evaluate_face(faces: &[DetectedFace], width: u32, height: u32, input: &Path) -> StageOutcome {
    let Some(face) = faces.iter().find(|f| !f.landmarks.is_empty()) else {
        return StageOutcome::failed(NO_FACE)
            .with_metric("face_found", false)
            .with_metric("face_count", 0);
    };

    // Landmarks are normalized; truncate to whole pixels.
    let points: Vec<(i64, i64)> = face
        .landmarks
        .iter()
        .map(|p| ((p.x * width as f32) as i64, (p.y * height as f32) as i64))
        .collect();
    let min_x = points.iter().map(|p| p.0).min().unwrap_or(0);
    let max_x = points.iter().map(|p| p.0).max().unwrap_or(0);
    let min_y = points.iter().map(|p| p.1).min().unwrap_or(0);
    let max_y = points.iter().map(|p| p.1).max().unwrap_or(0);

    let box_area = ((max_x - min_x) * (max_y - min_y)) as f64;
    let image_area = (width as f64 * height as f64).max(1.0);
    let ratio = box_area / image_area;

    let message = if ratio < MIN_FACE_RATIO {
        Err(TOO_SMALL)
    } else if ratio > MAX_FACE_RATIO {
        Err(TOO_CLOSE)
    } else {
        Ok(Stage::FaceDetection.done_message())
    };

    let outcome = match message {
        Ok(msg) => StageOutcome::succeeded(msg, input.to_path_buf()),
        Err(msg) => StageOutcome::failed(msg),
    };
    outcome
        .with_metric("face_found", true)
        .with_metric("face_count", faces.len())
        .with_metric("landmarks", face.landmarks.len())
        .with_metric(
            "bounding_box",
            json!({
                "x": min_x,
                "y": min_y,
                "width": max_x - min_x,
                "height": max_y - min_y,
            }),
        )
        .with_metric("face_area_ratio", ratio)
        .with_metric("image_dimensions", json!([width, height]))
}

pub async fn image_dimensions(path: PathBuf) -> anyhow::Result<(u32, u32)> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<(u32, u32)> {
        let dims = image::ImageReader::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .with_guessed_format()?
            .into_dimensions()?;
        Ok(dims)
    })
    .await?
}

#[async_trait]
impl StageAdapter for FaceCheckAdapter {
    fn stage(&self) -> Stage {
        Stage::FaceDetection
    }

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageOutcome> {
        let (width, height) = image_dimensions(ctx.input.clone()).await?;
        let faces = self.detector.detect(&ctx.input).await?;
        tracing::debug!(
            "Job {}: {} face(s) in {}x{} image",
            ctx.job_id,
            faces.len(),
            width,
            height
        );
        Ok(evaluate_face(&faces, width, height, &ctx.input))
    }
}
