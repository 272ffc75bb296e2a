//! Executor error types.
//!
//! [`PlanError`] and [`ExecutorError`] are structural: they abort before
//! any provider call. Per-node problems during an apply are not errors at
//! this level; they are reported as [`NodeFailure`]s inside the
//! [`ApplyReport`](crate::ApplyReport).

use thiserror::Error;

use ridge_core::CoreError;
use ridgeline_graph::GraphError;
use ridgeline_provider::ProviderError;
use ridgeline_secrets::SecretError;
use ridgeline_state::StateError;

pub type PlanResult<T> = Result<T, PlanError>;

/// The desired topology cannot be planned.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("plan entry {0} is not in the desired topology")]
    PlanMismatch(String),
}

impl From<GraphError> for ExecutorError {
    fn from(e: GraphError) -> Self {
        ExecutorError::Plan(PlanError::Graph(e))
    }
}

/// Why a single node did not reach its target state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeFailure {
    #[error("provider error: {0}")]
    Provider(ProviderError),

    /// Skipped because an upstream node failed.
    #[error("dependency {upstream} failed")]
    DependencyFailed { upstream: String },

    #[error("principal {principal} was refused access to secret {handle}")]
    SecretAccessDenied { handle: String, principal: String },

    #[error("secret error: {0}")]
    Secret(String),

    #[error("unresolved reference {0}")]
    UnresolvedReference(String),

    #[error("state store error: {0}")]
    State(String),

    #[error("lifecycle violation: {0}")]
    Lifecycle(String),

    /// Not started because the apply was cancelled.
    #[error("cancelled before start")]
    Cancelled,
}

impl From<ProviderError> for NodeFailure {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::SecretAccessDenied { handle, principal } => {
                NodeFailure::SecretAccessDenied { handle, principal }
            }
            other => NodeFailure::Provider(other),
        }
    }
}

impl From<SecretError> for NodeFailure {
    fn from(e: SecretError) -> Self {
        match e {
            SecretError::Provider(p) => p.into(),
            other => NodeFailure::Secret(other.to_string()),
        }
    }
}

impl From<StateError> for NodeFailure {
    fn from(e: StateError) -> Self {
        NodeFailure::State(e.to_string())
    }
}

impl From<CoreError> for NodeFailure {
    fn from(e: CoreError) -> Self {
        NodeFailure::Lifecycle(e.to_string())
    }
}
