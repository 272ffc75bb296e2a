//! Error types for resource model construction and topology parsing.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while building resources or loading a topology.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid resource id {0:?}: must match ^[a-z][a-z0-9_-]*$")]
    InvalidId(String),

    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    #[error("invalid attribute reference {0:?}: expected \"resource.attribute\"")]
    InvalidReference(String),

    #[error("invalid config for {resource}: {message}")]
    InvalidConfig { resource: String, message: String },

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("no value for secret {secret}: {reason}")]
    MissingSecretValue { secret: String, reason: String },

    #[error("resource {resource} is {state}; outputs can only be set on entry to active")]
    OutputsSealed { resource: String, state: String },

    #[error("secret digest key must be {expected} bytes, got {actual}")]
    InvalidDigestKey { expected: usize, actual: usize },

    #[error("failed to generate secret digest key: {0}")]
    Entropy(String),

    #[error("duplicate resource id: {0}")]
    DuplicateId(String),

    #[error("failed to read topology: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse topology: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render topology: {0}")]
    Render(#[from] toml::ser::Error),
}

impl CoreError {
    pub(crate) fn config(resource: &str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            resource: resource.to_string(),
            message: message.into(),
        }
    }
}
