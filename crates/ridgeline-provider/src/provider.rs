//! The provider adapter trait.
//!
//! Methods return boxed futures so the trait stays object-safe; the
//! executor and the control loops hold an `Arc<dyn Provider>`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_core::Stream;
use serde::{Deserialize, Serialize};

use ridge_core::{ResourceKind, SecretValue, Value};

use crate::error::ProviderResult;

/// Boxed future returned by provider calls.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;

/// Lazy, infinite, non-restartable sequence of metric samples.
pub type MetricStream = Pin<Box<dyn Stream<Item = MetricSample> + Send>>;

/// Attributes a provider reports for a resource.
pub type Outputs = BTreeMap<String, Value>;

/// Opaque provider-side identifier for a created resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceHandle(pub String);

impl ResourceHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub handle: ResourceHandle,
    pub outputs: Outputs,
}

/// What the provider currently holds for a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveResource {
    pub config: BTreeMap<String, Value>,
    pub outputs: Outputs,
}

/// Changed and removed config keys for an in-place update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDelta {
    pub set: BTreeMap<String, Value>,
    pub removed: Vec<String>,
}

impl ConfigDelta {
    /// Compute the delta that turns `before` into `after`.
    pub fn between(before: &BTreeMap<String, Value>, after: &BTreeMap<String, Value>) -> Self {
        let set = after
            .iter()
            .filter(|(k, v)| before.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let removed = before
            .keys()
            .filter(|k| !after.contains_key(*k))
            .cloned()
            .collect();
        Self { set, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    /// Every field the delta touches.
    pub fn fields(&self) -> Vec<String> {
        self.set
            .keys()
            .cloned()
            .chain(self.removed.iter().cloned())
            .collect()
    }
}

/// One observation of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    pub value: f64,
}

impl MetricSample {
    pub fn new(timestamp_ms: u64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// Handle and version returned when a secret is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretHandle {
    pub handle: String,
    pub version: u32,
}

/// Abstract cloud provider.
pub trait Provider: Send + Sync {
    /// Create a resource and return its handle plus provider-assigned
    /// outputs (endpoints, ids, ...).
    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        config: &'a BTreeMap<String, Value>,
    ) -> ProviderFuture<'a, Created>;

    /// Read live config and outputs, used to detect drift.
    fn read<'a>(&'a self, handle: &'a ResourceHandle) -> ProviderFuture<'a, LiveResource>;

    /// Apply an in-place change. Fails with
    /// [`ProviderError::ReplacementRequired`](crate::ProviderError::ReplacementRequired)
    /// when a field cannot be mutated.
    fn update<'a>(
        &'a self,
        handle: &'a ResourceHandle,
        delta: &'a ConfigDelta,
    ) -> ProviderFuture<'a, Outputs>;

    fn destroy<'a>(&'a self, handle: &'a ResourceHandle) -> ProviderFuture<'a, ()>;

    /// Subscribe to a metric. Each call returns a fresh stream that yields
    /// samples published after the call.
    fn stream_metric(
        &self,
        handle: &ResourceHandle,
        metric: &str,
        period: Duration,
    ) -> ProviderResult<MetricStream>;

    /// Deliver a notification (email, SMS, topic) to `target`.
    fn notify<'a>(&'a self, target: &'a str, message: &'a str) -> ProviderFuture<'a, ()>;

    /// Store a secret. Storing under an existing name creates a new version
    /// and keeps the handle.
    fn put_secret<'a>(
        &'a self,
        name: &'a str,
        value: &'a SecretValue,
    ) -> ProviderFuture<'a, SecretHandle>;

    /// Allow `principal` to read the secret behind `handle`.
    fn grant_access<'a>(&'a self, handle: &'a str, principal: &'a str) -> ProviderFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, i64)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Int(*v)))
            .collect()
    }

    #[test]
    fn delta_between_configs() {
        let before = map(&[("a", 1), ("b", 2), ("c", 3)]);
        let after = map(&[("a", 1), ("b", 20), ("d", 4)]);
        let delta = ConfigDelta::between(&before, &after);
        assert_eq!(delta.set, map(&[("b", 20), ("d", 4)]));
        assert_eq!(delta.removed, vec!["c".to_string()]);
        assert_eq!(delta.fields(), vec!["b", "d", "c"]);
    }

    #[test]
    fn identical_configs_have_empty_delta() {
        let cfg = map(&[("a", 1)]);
        assert!(ConfigDelta::between(&cfg, &cfg).is_empty());
    }

    #[test]
    fn handle_serializes_transparently() {
        let handle = ResourceHandle::from("network-0001");
        assert_eq!(serde_json::to_string(&handle).unwrap(), "\"network-0001\"");
    }
}
