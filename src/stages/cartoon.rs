use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;

use crate::models::{ArtifactKind, Stage, StageOutcome};
use crate::pipeline::polling::{PollState, PollingWaiter, WaitError};
use crate::providers::download;
use crate::providers::replicate::{ImageToImageInput, ReplicateClient};
use crate::stages::{StageAdapter, StageContext};
use crate::storage::ArtifactStore;

const NUM_INFERENCE_STEPS: u32 = 30;
const GUIDANCE_SCALE: f32 = 7.5;
const PROMPT_STRENGTH: f32 = 0.75;
const SCHEDULER: &str = "K_EULER_ANCESTRAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CartoonStyle {
    #[default]
    Pixar,
    Disney,
    Cartoon3d,
}

impl CartoonStyle {
    /// Parse a style tag, falling back to the default for unknown tags.
    pub fn from_tag(tag: &str) -> Self {
        tag.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown cartoon style '{}', using pixar", tag);
            CartoonStyle::default()
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CartoonStyle::Pixar => "pixar",
            CartoonStyle::Disney => "disney",
            CartoonStyle::Cartoon3d => "3d_cartoon",
        }
    }

    pub fn prompt(self) -> &'static str {
        match self {
            CartoonStyle::Pixar => {
                "3D Pixar character portrait, smooth features, big expressive eyes, clean render, \
                 studio lighting, colorful, CGI animation style, cute, friendly expression, \
                 high quality 3D render"
            }
            CartoonStyle::Disney => {
                "Disney 3D animated character, smooth skin, expressive eyes, vibrant colors, \
                 professional animation style, clean render"
            }
            CartoonStyle::Cartoon3d => {
                "3D cartoon character, stylized features, vibrant colors, clean render, \
                 animation ready, professional quality"
            }
        }
    }

    pub fn negative_prompt(self) -> &'static str {
        match self {
            CartoonStyle::Pixar => {
                "realistic, photograph, ugly, blurry, lowres, bad anatomy, deformed, disfigured, \
                 horror, scary, adult themes"
            }
            CartoonStyle::Disney => "realistic, photograph, ugly, blurry, lowres, bad anatomy",
            CartoonStyle::Cartoon3d => "realistic, photograph, ugly, blurry, lowres",
        }
    }
}

impl fmt::Display for CartoonStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CartoonStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pixar" => Ok(CartoonStyle::Pixar),
            "disney" => Ok(CartoonStyle::Disney),
            "3d_cartoon" => Ok(CartoonStyle::Cartoon3d),
            other => Err(format!("unknown cartoon style: {}", other)),
        }
    }
}

/// Downscale to fit `max_dimension`, drop alpha and re-encode as PNG.
pub fn prepare_image(path: &std::path::Path, max_dimension: u32) -> anyhow::Result<Vec<u8>> {
    let img = image::open(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let img = if img.width() > max_dimension || img.height() > max_dimension {
        img.resize(max_dimension, max_dimension, image::imageops::FilterType::Lanczos3)
    } else {
        img
    };
    let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Cursor::new(Vec::new());
    rgb.write_to(&mut buf, image::ImageFormat::Png)?;
    Ok(buf.into_inner())
}

pub fn png_data_uri(png: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

/// Turns the portrait into a stylized cartoon through a hosted
/// image-to-image model.
pub struct CartoonizeAdapter {
    client: ReplicateClient,
    waiter: PollingWaiter,
    style: CartoonStyle,
    max_dimension: u32,
    download_timeout: Duration,
    artifacts: ArtifactStore,
}

impl CartoonizeAdapter {
    pub fn new(
        client: ReplicateClient,
        waiter: PollingWaiter,
        style: CartoonStyle,
        max_dimension: u32,
        download_timeout: Duration,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            client,
            waiter,
            style,
            max_dimension,
            download_timeout,
            artifacts,
        }
    }

    fn failed(&self, reason: impl fmt::Display) -> StageOutcome {
        StageOutcome::failed(format!("Cartoonization failed: {}", reason))
            .with_metric("style", self.style.as_str())
    }
}

#[async_trait]
impl StageAdapter for CartoonizeAdapter {
    fn stage(&self) -> Stage {
        Stage::Cartoonization
    }

    async fn execute(&self, ctx: &StageContext) -> anyhow::Result<StageOutcome> {
        let input: PathBuf = ctx.input.clone();
        let max_dimension = self.max_dimension;
        let png = tokio::task::spawn_blocking(move || prepare_image(&input, max_dimension)).await??;

        let request = ImageToImageInput {
            image: png_data_uri(&png),
            prompt: self.style.prompt().to_string(),
            negative_prompt: self.style.negative_prompt().to_string(),
            num_inference_steps: NUM_INFERENCE_STEPS,
            guidance_scale: GUIDANCE_SCALE,
            prompt_strength: PROMPT_STRENGTH,
            scheduler: SCHEDULER.to_string(),
        };

        let prediction = match self.client.create_prediction(&request).await {
            Ok(p) => p,
            Err(e) => return Ok(self.failed(e)),
        };
        tracing::info!(
            "Job {}: cartoon prediction {} created ({} style)",
            ctx.job_id,
            prediction.id,
            self.style
        );

        let output_url = match prediction.poll_state() {
            PollState::Ready(url) => Ok(url),
            PollState::Failed(reason) => Err(WaitError::RemoteFailed(reason)),
            PollState::Pending => {
                let client = &self.client;
                let id = prediction.id.as_str();
                self.waiter
                    .wait(move || async move {
                        match client.get_prediction(id).await {
                            Ok(p) => p.poll_state(),
                            Err(e) => PollState::Failed(e.to_string()),
                        }
                    })
                    .await
            }
        };
        let output_url = match output_url {
            Ok(url) => url,
            Err(e) => return Ok(self.failed(e)),
        };

        let dest = self.artifacts.output_path(ctx.job_id, ArtifactKind::Cartoon);
        if let Err(e) = download(&output_url, &dest, self.download_timeout).await {
            return Ok(self.failed(e));
        }

        Ok(StageOutcome::succeeded(
            format!("Successfully cartoonized image with {} style", self.style),
            dest,
        )
        .with_metric("style", self.style.as_str())
        .with_metric("prediction_id", prediction.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_tags() {
        assert_eq!(CartoonStyle::from_tag("disney"), CartoonStyle::Disney);
        assert_eq!(CartoonStyle::from_tag("3d_cartoon"), CartoonStyle::Cartoon3d);
        assert_eq!(CartoonStyle::from_tag("anime"), CartoonStyle::Pixar);
        assert_eq!(CartoonStyle::Cartoon3d.to_string(), "3d_cartoon");
    }

    #[test]
    fn test_prompts_are_distinct() {
        assert!(CartoonStyle::Pixar.prompt().starts_with("3D Pixar character portrait"));
        assert!(CartoonStyle::Pixar.negative_prompt().ends_with("adult themes"));
        assert!(!CartoonStyle::Pixar.prompt().contains("  "));
        assert_ne!(CartoonStyle::Disney.prompt(), CartoonStyle::Cartoon3d.prompt());
    }

    #[test]
    fn test_prepare_image_downscales_and_drops_alpha() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("big.png");
        image::RgbaImage::new(2048, 1536).save(&path).unwrap();

        let png = prepare_image(&path, 1024).expect("prepare");
        let decoded = image::load_from_memory(&png).expect("decode");
        assert_eq!((decoded.width(), decoded.height()), (1024, 768));
        assert_eq!(decoded.color(), image::ColorType::Rgb8);
    }

    #[test]
    fn test_prepare_image_keeps_small_images() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("small.jpg");
        image::RgbImage::new(600, 600).save(&path).unwrap();

        let png = prepare_image(&path, 1024).expect("prepare");
        let decoded = image::load_from_memory(&png).expect("decode");
        assert_eq!((decoded.width(), decoded.height()), (600, 600));
    }

    #[test]
    fn test_png_data_uri() {
        assert_eq!(png_data_uri(b"abc"), "data:image/png;base64,YWJj");
    }
}
