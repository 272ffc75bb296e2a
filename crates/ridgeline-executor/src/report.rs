//! Apply results.

use std::fmt;

use ridge_core::{LifecycleState, ResourceId};

use crate::error::NodeFailure;
use crate::plan::Operation;

/// Where one node ended up after an apply.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub resource_id: ResourceId,
    pub operation: Operation,
    pub state: LifecycleState,
    pub failure: Option<NodeFailure>,
}

impl NodeOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Never attempted: an upstream node failed or the apply was cancelled.
    pub fn skipped(&self) -> bool {
        matches!(
            self.failure,
            Some(NodeFailure::DependencyFailed { .. } | NodeFailure::Cancelled)
        )
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some() && !self.skipped()
    }
}

/// Structured partial result of an apply, one outcome per plan entry in
/// plan order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    outcomes: Vec<NodeOutcome>,
}

impl ApplyReport {
    pub(crate) fn new(outcomes: Vec<NodeOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn outcomes(&self) -> &[NodeOutcome] {
        &self.outcomes
    }

    pub fn outcome(&self, id: &str) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.resource_id == id)
    }

    pub fn state_of(&self, id: &str) -> Option<LifecycleState> {
        self.outcome(id).map(|o| o.state)
    }

    pub fn failure_of(&self, id: &str) -> Option<&NodeFailure> {
        self.outcome(id).and_then(|o| o.failure.as_ref())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes.iter().filter(|o| o.succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes.iter().filter(|o| o.failed())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes.iter().filter(|o| o.skipped())
    }

    /// Every node reached its target state.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(NodeOutcome::succeeded)
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded().count(),
            self.failed().count(),
            self.skipped().count()
        )
    }
}
