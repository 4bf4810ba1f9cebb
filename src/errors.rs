use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// Recover a `ForgeError` carried inside an `anyhow::Error`, or wrap the
    /// error as internal.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        err.downcast::<ForgeError>()
            .unwrap_or_else(|other| ForgeError::Internal(format!("{:#}", other)))
    }
}
