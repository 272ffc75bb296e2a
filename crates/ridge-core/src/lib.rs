//! ridge-core — shared types for the Ridgeline orchestration engine.
//!
//! Everything the other crates agree on lives here:
//!
//! - [`value`] — configuration values and `{ ref = "producer.attribute" }`
//!   references between resources
//! - [`resource`] — the resource model, lifecycle states and dependency edges
//! - [`defaults`] — process-wide default tags, passed explicitly into every
//!   resource constructor
//! - [`policy`] — scaling policies and alarm definitions read out of resource
//!   config
//! - [`secret`] — redacting wrapper for sensitive values
//! - [`config`] / [`topology`] — `topology.toml` parsing and the reference
//!   media-stack topology

pub mod config;
pub mod defaults;
pub mod duration;
pub mod error;
pub mod policy;
pub mod resource;
pub mod secret;
pub mod topology;
pub mod value;

pub use config::{EngineConfig, RetryConfig};
pub use defaults::Defaults;
pub use error::{CoreError, CoreResult};
pub use policy::{AlarmSpec, AlarmState, Comparison, ScalingPolicy};
pub use resource::{DependencyEdge, LifecycleState, Resource, ResourceId, ResourceKind};
pub use secret::{DigestKey, SecretBundle, SecretValue};
pub use topology::Topology;
pub use value::{AttributeRef, Value};
