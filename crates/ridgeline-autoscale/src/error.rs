use thiserror::Error;

use ridge_core::CoreError;
use ridgeline_provider::ProviderError;
use ridgeline_state::StateError;

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;

#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("no scaling policy recorded for {0}")]
    UnknownTarget(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),
}
