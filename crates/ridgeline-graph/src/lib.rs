//! ridgeline-graph — dependency ordering for resource graphs.
//!
//! Builds a directed graph from each resource's explicit `depends_on` set
//! and the edges inferred from `{ ref = "producer.attribute" }` values, then
//! produces a creation order with Kahn's algorithm. Ties between
//! independent resources are broken by declaration order, so the same input
//! always yields the same order.
//!
//! ```text
//! vpc ──► database ──► app ──► app_cpu_high
//!   └───► cache ───────┘
//! ```
//!
//! Teardown order is recomputed on every call and is the exact reverse of
//! the creation order.

pub mod error;
pub mod graph;

pub use error::{GraphError, GraphResult};
pub use graph::DependencyGraph;
