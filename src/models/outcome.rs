use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What a stage adapter reports back. The orchestrator only looks at
/// `success`, `message` and `artifact`; `metrics` go to the step log as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageOutcome {
    pub success: bool,
    pub message: String,
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
}

impl StageOutcome {
    pub fn succeeded(message: impl Into<String>, artifact: PathBuf) -> Self {
        Self {
            success: true,
            message: message.into(),
            artifact: Some(artifact),
            metrics: serde_json::Map::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            artifact: None,
            metrics: serde_json::Map::new(),
        }
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }
}
