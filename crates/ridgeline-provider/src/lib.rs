//! ridgeline-provider — the boundary between the engine and the cloud.
//!
//! The engine never talks to a cloud API directly. Every create, read,
//! update and destroy goes through the object-safe [`Provider`] trait, as do
//! metric streams, notifications and secret storage.
//!
//! # Components
//!
//! - **`provider`** — the [`Provider`] trait and its request/response types
//! - **`retry`** — [`RetryPolicy`], exponential backoff for
//!   [`ProviderError::Unavailable`]
//! - **`simulated`** — [`SimulatedProvider`], an in-process provider with
//!   fault injection, used by tests and by `ridge` for dry runs

pub mod error;
pub mod provider;
pub mod retry;
pub mod simulated;

pub use error::{ProviderError, ProviderResult};
pub use provider::{
    ConfigDelta, Created, LiveResource, MetricSample, MetricStream, Outputs, Provider,
    ProviderFuture, ResourceHandle, SecretHandle,
};
pub use retry::RetryPolicy;
pub use simulated::{ProviderCall, SimulatedProvider};
