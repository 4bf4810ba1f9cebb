use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ForgeError;
use crate::models::printer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_max_upload_size_mb")]
    pub max_upload_size_mb: u64,
    #[serde(default = "default_target_height_mm")]
    pub target_height_mm: f32,
    #[serde(default = "default_printer_profile")]
    pub printer_profile: String,
    #[serde(default = "default_cartoon_style")]
    pub cartoon_style: String,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub face: FaceConfig,
    #[serde(default)]
    pub cartoon: CartoonConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub image: ImageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceConfig {
    #[serde(default = "default_face_api_url")]
    pub api_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartoonConfig {
    #[serde(default = "default_cartoon_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_cartoon_model_version")]
    pub model_version: String,
    #[serde(default = "default_cartoon_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cartoon_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_input_dimension")]
    pub max_input_dimension: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_max_faces")]
    pub max_faces: usize,
    #[serde(default = "default_true")]
    pub repair: bool,
    #[serde(default = "default_true")]
    pub simplify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_min_dimension")]
    pub min_dimension: u32,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_upload_size_mb() -> u64 {
    10
}

fn default_target_height_mm() -> f32 {
    80.0
}

fn default_printer_profile() -> String {
    "ender3v2".to_string()
}

fn default_cartoon_style() -> String {
    "pixar".to_string()
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_face_api_url() -> String {
    "http://127.0.0.1:8501".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_download_timeout_secs() -> u64 {
    60
}

fn default_cartoon_api_url() -> String {
    "https://api.replicate.com/v1".to_string()
}

fn default_cartoon_model_version() -> String {
    "39ed52f2a78e934b3ba6e2a89f5b1c712de7dfea535525255b1aa35c5565e08b".to_string()
}

fn default_cartoon_timeout_secs() -> u64 {
    120
}

fn default_cartoon_poll_interval_secs() -> u64 {
    2
}

fn default_max_input_dimension() -> u32 {
    1024
}

fn default_generation_api_url() -> String {
    "https://api.meshy.ai/openapi/v2".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    300
}

fn default_generation_poll_interval_secs() -> u64 {
    5
}

fn default_max_faces() -> usize {
    100_000
}

fn default_true() -> bool {
    true
}

fn default_min_dimension() -> u32 {
    512
}

fn default_max_dimension() -> u32 {
    4096
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            api_url: default_face_api_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for CartoonConfig {
    fn default() -> Self {
        Self {
            api_url: default_cartoon_api_url(),
            api_token: None,
            model_version: default_cartoon_model_version(),
            timeout_secs: default_cartoon_timeout_secs(),
            poll_interval_secs: default_cartoon_poll_interval_secs(),
            max_input_dimension: default_max_input_dimension(),
            request_timeout_secs: default_request_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_url: default_generation_api_url(),
            api_key: None,
            timeout_secs: default_generation_timeout_secs(),
            poll_interval_secs: default_generation_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_faces: default_max_faces(),
            repair: true,
            simplify: true,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            min_dimension: default_min_dimension(),
            max_dimension: default_max_dimension(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            max_upload_size_mb: default_max_upload_size_mb(),
            target_height_mm: default_target_height_mm(),
            printer_profile: default_printer_profile(),
            cartoon_style: default_cartoon_style(),
            broadcast_capacity: default_broadcast_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            face: FaceConfig::default(),
            cartoon: CartoonConfig::default(),
            generation: GenerationConfig::default(),
            mesh: MeshConfig::default(),
            image: ImageConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_size_mb as usize).saturating_mul(1024 * 1024)
    }

    /// Apply the process environment on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("MAX_UPLOAD_SIZE_MB") {
            match raw.trim().parse() {
                Ok(v) => self.max_upload_size_mb = v,
                Err(_) => tracing::warn!("Ignoring invalid MAX_UPLOAD_SIZE_MB: {}", raw),
            }
        }
        if let Some(raw) = lookup("DEFAULT_TARGET_HEIGHT") {
            match raw.trim().parse() {
                Ok(v) => self.target_height_mm = v,
                Err(_) => tracing::warn!("Ignoring invalid DEFAULT_TARGET_HEIGHT: {}", raw),
            }
        }
        if let Some(profile) = lookup("DEFAULT_PRINTER_PROFILE") {
            self.printer_profile = profile;
        }
        if let Some(token) = lookup("REPLICATE_API_TOKEN").filter(|t| !t.is_empty()) {
            self.cartoon.api_token = Some(token);
        }
        if let Some(key) = lookup("MESHY_API_KEY").filter(|k| !k.is_empty()) {
            self.generation.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ForgeError> {
        let profile = printer::get_profile(&self.printer_profile)
            .map_err(|e| ForgeError::Config(e.to_string()))?;

        if !(self.target_height_mm > 0.0) {
            return Err(ForgeError::Config(format!(
                "target_height_mm must be positive, got {}",
                self.target_height_mm
            )));
        }
        if self.target_height_mm > profile.max_model_height {
            return Err(ForgeError::Config(format!(
                "target_height_mm {} exceeds {} max model height {}",
                self.target_height_mm, profile.key, profile.max_model_height
            )));
        }
        if self.max_upload_size_mb == 0 {
            return Err(ForgeError::Config(
                "max_upload_size_mb must be at least 1".to_string(),
            ));
        }
        if self.cartoon.poll_interval_secs == 0 || self.generation.poll_interval_secs == 0 {
            return Err(ForgeError::Config(
                "poll_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.image.min_dimension > self.image.max_dimension {
            return Err(ForgeError::Config(format!(
                "image.min_dimension {} is larger than image.max_dimension {}",
                self.image.min_dimension, self.image.max_dimension
            )));
        }
        if self.mesh.max_faces == 0 {
            return Err(ForgeError::Config("mesh.max_faces must be non-zero".to_string()));
        }
        Ok(())
    }
}
