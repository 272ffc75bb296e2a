use thiserror::Error;

use ridgeline_provider::ProviderError;
use ridgeline_state::StateError;

pub type AlarmResult<T> = Result<T, AlarmError>;

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("alarm {0} is not recorded in state")]
    UnknownAlarm(String),

    /// The monitored resource has no handle (not yet created).
    #[error("alarm {alarm} target {target} cannot be resolved")]
    UnresolvedTarget { alarm: String, target: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    State(#[from] StateError),
}
