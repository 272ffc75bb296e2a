//! Provider error taxonomy.

use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors a provider call can return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Transient: the provider could not be reached or throttled the call.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The update touches fields that cannot change in place.
    #[error("replacement required for fields: {}", fields.join(", "))]
    ReplacementRequired { fields: Vec<String> },

    #[error("principal {principal} may not read secret {handle}")]
    SecretAccessDenied { handle: String, principal: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// The provider refused the request (invalid config, quota, ...).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}
