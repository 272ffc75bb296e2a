//! Error types for the secret coordinator.

use thiserror::Error;

use ridgeline_provider::ProviderError;
use ridgeline_state::StateError;

pub type SecretResult<T> = Result<T, SecretError>;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("no value supplied for secret resource {0}")]
    MissingValue(String),

    #[error("unknown secret {0}")]
    UnknownSecret(String),

    #[error("secret resource {0} has no secret_name")]
    MissingName(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl SecretError {
    /// Whether the provider refused an access grant.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            SecretError::Provider(ProviderError::SecretAccessDenied { .. })
        )
    }
}
