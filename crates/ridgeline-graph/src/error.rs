//! Graph construction and ordering errors.

use thiserror::Error;

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The dependency declarations contain a cycle. `cycle` lists the
    /// resources along it, starting and ending with the same id.
    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("{consumer} depends on unknown resource {producer}")]
    UnknownDependency { consumer: String, producer: String },

    #[error("duplicate resource id: {0}")]
    DuplicateId(String),
}
