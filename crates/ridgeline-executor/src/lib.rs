//! ridgeline-executor — plan and apply.
//!
//! [`plan`] diffs a desired [`Topology`](ridge_core::Topology) against the
//! recorded state and yields one [`PlanEntry`] per resource. [`Executor`]
//! carries a plan out against a provider: dependency ordered, bounded
//! parallelism, references resolved at the moment each node starts.
//!
//! ```text
//! Topology ──► plan() ──► Plan ──► Executor::apply ──► ApplyReport
//!                ▲                      │
//!           StateStore ◄────────────────┘ every transition persisted
//! ```
//!
//! [`Executor::refresh`] reads live resources back from the provider and
//! reports [`Drift`]; [`Executor::plan_with_drift`] folds it into a plan.

pub mod apply;
pub mod drift;
pub mod error;
pub mod plan;
pub mod report;

pub use apply::Executor;
pub use drift::{Drift, DriftField, DriftReport};
pub use error::{ExecutorError, ExecutorResult, NodeFailure, PlanError, PlanResult};
pub use plan::{FieldChange, Operation, Plan, PlanEntry, PlanSummary, plan, plan_with_drift};
pub use report::{ApplyReport, NodeOutcome};
