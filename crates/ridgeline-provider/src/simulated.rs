//! In-process provider with fault injection.
//!
//! `SimulatedProvider` keeps every resource, secret and metric subscription
//! in memory. Handles are deterministic (`network-0001`, `secret-0002`, ...)
//! and outputs are derived from the resource name, so the same topology
//! always yields the same plan. Tests use the fault hooks to drive the
//! engine through transient outages, permanent rejections, access denials
//! and drift.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use ridge_core::{ResourceKind, SecretValue, Value};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{
    ConfigDelta, Created, LiveResource, MetricSample, MetricStream, Outputs, Provider,
    ProviderFuture, ResourceHandle, SecretHandle,
};

/// One recorded provider call. Secret values are never recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Create { kind: ResourceKind, name: String },
    Read { handle: String },
    Update { handle: String, fields: Vec<String> },
    Destroy { handle: String },
    StreamMetric { handle: String, metric: String },
    Notify { target: String, message: String },
    PutSecret { name: String },
    GrantAccess { handle: String, principal: String },
}

impl ProviderCall {
    /// Whether the call changes provider-side state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            ProviderCall::Read { .. } | ProviderCall::StreamMetric { .. }
        )
    }
}

#[derive(Serialize, Deserialize)]
struct LiveEntry {
    kind: ResourceKind,
    name: String,
    config: BTreeMap<String, Value>,
    outputs: Outputs,
}

struct StoredSecret {
    name: String,
    value: SecretValue,
    version: u32,
    readers: BTreeSet<String>,
}

/// Provider-side state that outlives a process: live resources and the
/// secret store. Faults, call log and subscriptions are not kept.
#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    next_seq: u64,
    resources: BTreeMap<String, LiveEntry>,
    secrets: BTreeMap<String, SnapshotSecret>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotSecret {
    name: String,
    value: String,
    version: u32,
    readers: BTreeSet<String>,
}

type Subscribers = Vec<mpsc::UnboundedSender<MetricSample>>;

#[derive(Default)]
struct Inner {
    next_seq: u64,
    resources: BTreeMap<String, LiveEntry>,
    secrets: BTreeMap<String, StoredSecret>,
    secret_handles: BTreeMap<String, String>,
    subscribers: BTreeMap<(String, String), Subscribers>,
    calls: Vec<ProviderCall>,
    notifications: Vec<(String, String)>,
    // Faults
    create_failures: BTreeMap<String, ProviderError>,
    replace_on_update: BTreeSet<String>,
    transient_failures: u32,
    denied_principals: BTreeSet<String>,
    latency: Duration,
    // Concurrency tracking
    in_flight: usize,
    peak_in_flight: usize,
}

impl Inner {
    fn next_handle(&mut self, prefix: &str) -> String {
        self.next_seq += 1;
        format!("{prefix}-{:04}", self.next_seq)
    }

    fn take_transient_failure(&mut self) -> Option<ProviderError> {
        if self.transient_failures == 0 {
            return None;
        }
        self.transient_failures -= 1;
        Some(ProviderError::Unavailable(
            "simulated throttling".to_string(),
        ))
    }
}

/// Cheaply cloneable in-memory provider.
#[derive(Clone, Default)]
pub struct SimulatedProvider {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Fault injection ─────────────────────────────────────────────

    /// Every create of a resource named `name` fails with `error`.
    pub fn fail_create_for(&self, name: &str, error: ProviderError) {
        self.lock().create_failures.insert(name.to_string(), error);
    }

    /// Every update of a resource named `name` answers
    /// `ReplacementRequired`, whatever fields it touches.
    pub fn require_replacement_for(&self, name: &str) {
        self.lock().replace_on_update.insert(name.to_string());
    }

    /// The next `n` create/update/destroy calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// Refuse to grant secret access to `principal`.
    pub fn deny_grants_to(&self, principal: &str) {
        self.lock().denied_principals.insert(principal.to_string());
    }

    /// Make every create/update/destroy take `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        let mut inner = self.lock();
        inner.create_failures.clear();
        inner.replace_on_update.clear();
        inner.transient_failures = 0;
        inner.denied_principals.clear();
    }

    /// Change a live config field behind the engine's back.
    pub fn drift(&self, handle: &ResourceHandle, key: &str, value: Value) -> ProviderResult<()> {
        let mut inner = self.lock();
        let entry = inner
            .resources
            .get_mut(handle.as_str())
            .ok_or_else(|| ProviderError::NotFound(handle.to_string()))?;
        entry.config.insert(key.to_string(), value);
        Ok(())
    }

    /// Publish a metric sample to every open subscription for
    /// `(handle, metric)`. Returns how many subscribers received it.
    pub fn push_metric(&self, handle: &ResourceHandle, metric: &str, sample: MetricSample) -> usize {
        let mut inner = self.lock();
        let key = (handle.to_string(), metric.to_string());
        let Some(subs) = inner.subscribers.get_mut(&key) else {
            return 0;
        };
        subs.retain(|tx| tx.send(sample).is_ok());
        subs.len()
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Calls that changed provider-side state.
    pub fn mutations(&self) -> Vec<ProviderCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    /// Delivered notifications as `(target, message)`.
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.lock().notifications.clone()
    }

    /// Handle of the live resource named `name`.
    pub fn handle_for(&self, name: &str) -> Option<ResourceHandle> {
        self.lock()
            .resources
            .iter()
            .find(|(_, e)| e.name == name)
            .map(|(h, _)| ResourceHandle(h.clone()))
    }

    pub fn live_count(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn contains(&self, handle: &ResourceHandle) -> bool {
        self.lock().resources.contains_key(handle.as_str())
    }

    /// Highest number of create/update/destroy calls running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    pub fn secret_version(&self, handle: &str) -> Option<u32> {
        self.lock().secrets.get(handle).map(|s| s.version)
    }

    /// Read a secret the way a runtime principal would.
    pub fn resolve_secret(&self, handle: &str, principal: &str) -> ProviderResult<SecretValue> {
        let inner = self.lock();
        let secret = inner
            .secrets
            .get(handle)
            .ok_or_else(|| ProviderError::NotFound(handle.to_string()))?;
        if !secret.readers.contains(principal) {
            return Err(ProviderError::SecretAccessDenied {
                handle: handle.to_string(),
                principal: principal.to_string(),
            });
        }
        Ok(secret.value.clone())
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Restore a provider saved with [`save`](Self::save). A missing file
    /// yields an empty provider.
    pub fn load(path: &Path) -> io::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        let snapshot: Snapshot = serde_json::from_str(&content)?;

        let provider = Self::new();
        {
            let mut inner = provider.lock();
            inner.next_seq = snapshot.next_seq;
            inner.resources = snapshot.resources;
            for (handle, secret) in snapshot.secrets {
                inner.secret_handles.insert(secret.name.clone(), handle.clone());
                inner.secrets.insert(
                    handle,
                    StoredSecret {
                        name: secret.name,
                        value: SecretValue::new(secret.value),
                        version: secret.version,
                        readers: secret.readers,
                    },
                );
            }
            debug!(
                path = %path.display(),
                resources = inner.resources.len(),
                secrets = inner.secrets.len(),
                "simulated provider restored"
            );
        }
        Ok(provider)
    }

    /// Write live resources and stored secrets to `path`.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = {
            let inner = self.lock();
            let snapshot = SnapshotRef {
                next_seq: inner.next_seq,
                resources: &inner.resources,
                secrets: inner
                    .secrets
                    .iter()
                    .map(|(handle, s)| {
                        (
                            handle.as_str(),
                            SnapshotSecretRef {
                                name: &s.name,
                                value: s.value.expose(),
                                version: s.version,
                                readers: &s.readers,
                            },
                        )
                    })
                    .collect(),
            };
            serde_json::to_string_pretty(&snapshot)?
        };
        std::fs::write(path, json)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn record(&self, call: ProviderCall) {
        self.lock().calls.push(call);
    }

    /// Enter a mutating call: count it in flight and return the latency
    /// to simulate.
    fn enter(&self) -> (InFlight<'_>, Duration) {
        let mut inner = self.lock();
        inner.in_flight += 1;
        inner.peak_in_flight = inner.peak_in_flight.max(inner.in_flight);
        (InFlight(self), inner.latency)
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    next_seq: u64,
    resources: &'a BTreeMap<String, LiveEntry>,
    secrets: BTreeMap<&'a str, SnapshotSecretRef<'a>>,
}

#[derive(Serialize)]
struct SnapshotSecretRef<'a> {
    name: &'a str,
    value: &'a str,
    version: u32,
    readers: &'a BTreeSet<String>,
}

struct InFlight<'a>(&'a SimulatedProvider);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
    }
}

async fn simulate_latency(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

fn unresolved_ref<'a>(config: impl IntoIterator<Item = &'a Value>) -> Option<String> {
    config
        .into_iter()
        .flat_map(|v| v.refs())
        .next()
        .map(|r| r.to_string())
}

fn str_field<'a>(config: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

/// Outputs a real provider would report for a resource of `kind`.
fn outputs_for(kind: ResourceKind, name: &str, config: &BTreeMap<String, Value>) -> Outputs {
    let mut out = Outputs::new();
    let mut set = |k: &str, v: Value| {
        out.insert(k.to_string(), v);
    };
    match kind {
        ResourceKind::Network => {
            set("vpc_id", Value::from(format!("vpc-{name}")));
            let zones = config
                .get("availability_zones")
                .and_then(Value::as_list)
                .map(|z| z.len())
                .unwrap_or(2)
                .max(1);
            let subnets = |tier: &str| {
                Value::List(
                    (0..zones)
                        .map(|i| Value::from(format!("subnet-{name}-{tier}-{i}")))
                        .collect(),
                )
            };
            set("public_subnet_ids", subnets("public"));
            set("private_subnet_ids", subnets("private"));
        }
        ResourceKind::LoadBalancer => {
            set("arn", Value::from(format!("arn:sim:elb:loadbalancer/{name}")));
            set("dns_name", Value::from(format!("{name}.elb.sim.internal")));
            set(
                "target_group_arn",
                Value::from(format!("arn:sim:elb:targetgroup/{name}")),
            );
        }
        ResourceKind::ComputeService => {
            set("service_arn", Value::from(format!("arn:sim:ecs:service/{name}")));
            set("cluster", Value::from(format!("{name}-cluster")));
            let desired = config
                .get("desired_count")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            set("desired_count", Value::Int(desired));
        }
        ResourceKind::RelationalStore => {
            let default_port = match str_field(config, "engine") {
                Some("mysql") | Some("mariadb") => 3306,
                _ => 5432,
            };
            let port = config.get("port").and_then(Value::as_i64).unwrap_or(default_port);
            let address = format!("{name}.db.sim.internal");
            set("endpoint", Value::from(format!("{address}:{port}")));
            set("address", Value::from(address));
            set("port", Value::Int(port));
        }
        ResourceKind::CacheCluster => {
            let default_port = match str_field(config, "engine") {
                Some("memcached") => 11211,
                _ => 6379,
            };
            let port = config.get("port").and_then(Value::as_i64).unwrap_or(default_port);
            let address = format!("{name}.cache.sim.internal");
            set("endpoint", Value::from(format!("{address}:{port}")));
            set("address", Value::from(address));
            set("port", Value::Int(port));
        }
        ResourceKind::ObjectStore => {
            let bucket = str_field(config, "bucket").unwrap_or(name).to_string();
            set("arn", Value::from(format!("arn:sim:s3:::{bucket}")));
            set("bucket_name", Value::from(bucket));
        }
        ResourceKind::Alarm => {
            set("arn", Value::from(format!("arn:sim:alarm:{name}")));
        }
        ResourceKind::Secret => {}
    }
    out
}

impl Provider for SimulatedProvider {
    fn create<'a>(
        &'a self,
        kind: ResourceKind,
        config: &'a BTreeMap<String, Value>,
    ) -> ProviderFuture<'a, Created> {
        Box::pin(async move {
            let name = str_field(config, "name")
                .unwrap_or(kind.as_str())
                .to_string();
            self.record(ProviderCall::Create {
                kind,
                name: name.clone(),
            });
            let (_guard, latency) = self.enter();
            simulate_latency(latency).await;

            let mut inner = self.lock();
            if let Some(err) = inner.take_transient_failure() {
                return Err(err);
            }
            if let Some(err) = inner.create_failures.get(&name) {
                return Err(err.clone());
            }
            if kind == ResourceKind::Secret {
                return Err(ProviderError::Rejected(
                    "secrets are stored with put_secret".to_string(),
                ));
            }
            if let Some(r) = unresolved_ref(config.values()) {
                return Err(ProviderError::Rejected(format!(
                    "config for {name} contains unresolved reference {r}"
                )));
            }

            let handle = inner.next_handle(kind.as_str());
            let outputs = outputs_for(kind, &name, config);
            inner.resources.insert(
                handle.clone(),
                LiveEntry {
                    kind,
                    name: name.clone(),
                    config: config.clone(),
                    outputs: outputs.clone(),
                },
            );
            debug!(%handle, %kind, %name, "simulated create");
            Ok(Created {
                handle: ResourceHandle(handle),
                outputs,
            })
        })
    }

    fn read<'a>(&'a self, handle: &'a ResourceHandle) -> ProviderFuture<'a, LiveResource> {
        Box::pin(async move {
            self.record(ProviderCall::Read {
                handle: handle.to_string(),
            });
            let inner = self.lock();
            let entry = inner
                .resources
                .get(handle.as_str())
                .ok_or_else(|| ProviderError::NotFound(handle.to_string()))?;
            Ok(LiveResource {
                config: entry.config.clone(),
                outputs: entry.outputs.clone(),
            })
        })
    }

    fn update<'a>(
        &'a self,
        handle: &'a ResourceHandle,
        delta: &'a ConfigDelta,
    ) -> ProviderFuture<'a, Outputs> {
        Box::pin(async move {
            self.record(ProviderCall::Update {
                handle: handle.to_string(),
                fields: delta.fields(),
            });
            let (_guard, latency) = self.enter();
            simulate_latency(latency).await;

            let mut guard = self.lock();
            let inner = &mut *guard;
            if let Some(err) = inner.take_transient_failure() {
                return Err(err);
            }
            let entry = inner
                .resources
                .get_mut(handle.as_str())
                .ok_or_else(|| ProviderError::NotFound(handle.to_string()))?;

            let forced = inner.replace_on_update.contains(&entry.name);
            let blocked: Vec<String> = delta
                .fields()
                .into_iter()
                .filter(|f| forced || entry.kind.requires_replace(f))
                .collect();
            if !blocked.is_empty() {
                return Err(ProviderError::ReplacementRequired { fields: blocked });
            }
            if let Some(r) = unresolved_ref(delta.set.values()) {
                return Err(ProviderError::Rejected(format!(
                    "update for {handle} contains unresolved reference {r}"
                )));
            }

            for key in &delta.removed {
                entry.config.remove(key);
            }
            entry
                .config
                .extend(delta.set.iter().map(|(k, v)| (k.clone(), v.clone())));
            entry.outputs = outputs_for(entry.kind, &entry.name, &entry.config);
            debug!(%handle, fields = ?delta.fields(), "simulated update");
            Ok(entry.outputs.clone())
        })
    }

    fn destroy<'a>(&'a self, handle: &'a ResourceHandle) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(ProviderCall::Destroy {
                handle: handle.to_string(),
            });
            let (_guard, latency) = self.enter();
            simulate_latency(latency).await;

            let mut inner = self.lock();
            if let Some(err) = inner.take_transient_failure() {
                return Err(err);
            }
            inner
                .resources
                .remove(handle.as_str())
                .ok_or_else(|| ProviderError::NotFound(handle.to_string()))?;
            // Closing the senders ends any open metric streams.
            inner.subscribers.retain(|(h, _), _| h != handle.as_str());
            debug!(%handle, "simulated destroy");
            Ok(())
        })
    }

    fn stream_metric(
        &self,
        handle: &ResourceHandle,
        metric: &str,
        period: Duration,
    ) -> ProviderResult<MetricStream> {
        self.record(ProviderCall::StreamMetric {
            handle: handle.to_string(),
            metric: metric.to_string(),
        });
        let mut inner = self.lock();
        if !inner.resources.contains_key(handle.as_str()) {
            return Err(ProviderError::NotFound(handle.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .subscribers
            .entry((handle.to_string(), metric.to_string()))
            .or_default()
            .push(tx);
        debug!(%handle, metric, period_secs = period.as_secs(), "metric stream opened");

        let samples = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|sample| (sample, rx))
        });
        Ok(Box::pin(samples))
    }

    fn notify<'a>(&'a self, target: &'a str, message: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(ProviderCall::Notify {
                target: target.to_string(),
                message: message.to_string(),
            });
            info!(target_address = target, body = message, "notification sent");
            self.lock()
                .notifications
                .push((target.to_string(), message.to_string()));
            Ok(())
        })
    }

    fn put_secret<'a>(
        &'a self,
        name: &'a str,
        value: &'a SecretValue,
    ) -> ProviderFuture<'a, SecretHandle> {
        Box::pin(async move {
            self.record(ProviderCall::PutSecret {
                name: name.to_string(),
            });
            let mut inner = self.lock();
            if let Some(handle) = inner.secret_handles.get(name).cloned() {
                if let Some(secret) = inner.secrets.get_mut(&handle) {
                    secret.value = value.clone();
                    secret.version += 1;
                    debug!(%handle, version = secret.version, "secret rotated");
                    return Ok(SecretHandle {
                        handle,
                        version: secret.version,
                    });
                }
            }

            let handle = inner.next_handle("secret");
            inner.secret_handles.insert(name.to_string(), handle.clone());
            inner.secrets.insert(
                handle.clone(),
                StoredSecret {
                    name: name.to_string(),
                    value: value.clone(),
                    version: 1,
                    readers: BTreeSet::new(),
                },
            );
            debug!(%handle, secret_name = name, "secret stored");
            Ok(SecretHandle { handle, version: 1 })
        })
    }

    fn grant_access<'a>(&'a self, handle: &'a str, principal: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(ProviderCall::GrantAccess {
                handle: handle.to_string(),
                principal: principal.to_string(),
            });
            let mut inner = self.lock();
            if inner.denied_principals.contains(principal) {
                return Err(ProviderError::SecretAccessDenied {
                    handle: handle.to_string(),
                    principal: principal.to_string(),
                });
            }
            let secret = inner
                .secrets
                .get_mut(handle)
                .ok_or_else(|| ProviderError::NotFound(handle.to_string()))?;
            secret.readers.insert(principal.to_string());
            debug!(handle, secret_name = %secret.name, principal, "secret access granted");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use ridge_core::AttributeRef;

    fn config(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn create_assigns_handle_and_outputs() {
        let p = SimulatedProvider::new();
        let created = p
            .create(
                ResourceKind::RelationalStore,
                &config(&[("name", Value::from("database")), ("engine", Value::from("postgres"))]),
            )
            .await
            .unwrap();

        assert_eq!(created.handle.as_str(), "relational_store-0001");
        assert_eq!(
            created.outputs["endpoint"],
            Value::from("database.db.sim.internal:5432")
        );
        assert_eq!(p.handle_for("database"), Some(created.handle));
    }

    #[tokio::test]
    async fn update_of_replace_field_is_refused() {
        let p = SimulatedProvider::new();
        let before = config(&[("name", Value::from("db")), ("engine", Value::from("postgres"))]);
        let created = p.create(ResourceKind::RelationalStore, &before).await.unwrap();

        let after = config(&[("name", Value::from("db")), ("engine", Value::from("mysql"))]);
        let delta = ConfigDelta::between(&before, &after);
        let err = p.update(&created.handle, &delta).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::ReplacementRequired {
                fields: vec!["engine".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn forced_replacement_refuses_any_update() {
        let p = SimulatedProvider::new();
        let before = config(&[("name", Value::from("app")), ("desired_count", Value::Int(2))]);
        let created = p.create(ResourceKind::ComputeService, &before).await.unwrap();
        p.require_replacement_for("app");

        let after = config(&[("name", Value::from("app")), ("desired_count", Value::Int(3))]);
        let err = p
            .update(&created.handle, &ConfigDelta::between(&before, &after))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::ReplacementRequired {
                fields: vec!["desired_count".to_string()]
            }
        );

        p.clear_faults();
        p.update(&created.handle, &ConfigDelta::between(&before, &after))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_recomputes_outputs() {
        let p = SimulatedProvider::new();
        let before = config(&[("name", Value::from("app")), ("desired_count", Value::Int(2))]);
        let created = p.create(ResourceKind::ComputeService, &before).await.unwrap();

        let after = config(&[("name", Value::from("app")), ("desired_count", Value::Int(3))]);
        let outputs = p
            .update(&created.handle, &ConfigDelta::between(&before, &after))
            .await
            .unwrap();
        assert_eq!(outputs["desired_count"], Value::Int(3));
    }

    #[tokio::test]
    async fn unresolved_refs_are_rejected() {
        let p = SimulatedProvider::new();
        let cfg = config(&[(
            "subnets",
            Value::Ref(AttributeRef::new("vpc", "public_subnet_ids")),
        )]);
        let err = p.create(ResourceKind::LoadBalancer, &cfg).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
        assert_eq!(p.live_count(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_consumed() {
        let p = SimulatedProvider::new();
        p.fail_next(1);
        let cfg = config(&[("name", Value::from("bucket"))]);
        assert!(p.create(ResourceKind::ObjectStore, &cfg).await.unwrap_err().is_transient());
        assert!(p.create(ResourceKind::ObjectStore, &cfg).await.is_ok());
    }

    #[tokio::test]
    async fn destroy_missing_handle_is_not_found() {
        let p = SimulatedProvider::new();
        let err = p.destroy(&ResourceHandle::from("network-9999")).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn secrets_version_and_enforce_access() {
        let p = SimulatedProvider::new();
        let first = p.put_secret("db_password", &SecretValue::new("hunter2")).await.unwrap();
        assert_eq!(first.version, 1);

        assert!(matches!(
            p.resolve_secret(&first.handle, "app-execution"),
            Err(ProviderError::SecretAccessDenied { .. })
        ));
        p.grant_access(&first.handle, "app-execution").await.unwrap();
        assert_eq!(
            p.resolve_secret(&first.handle, "app-execution").unwrap().expose(),
            "hunter2"
        );

        let second = p.put_secret("db_password", &SecretValue::new("hunter3")).await.unwrap();
        assert_eq!(second.handle, first.handle);
        assert_eq!(second.version, 2);
        // Grants survive rotation.
        assert_eq!(
            p.resolve_secret(&first.handle, "app-execution").unwrap().expose(),
            "hunter3"
        );

        let log = format!("{:?}", p.calls());
        assert!(!log.contains("hunter"));
    }

    #[tokio::test]
    async fn denied_principal_cannot_be_granted() {
        let p = SimulatedProvider::new();
        let s = p.put_secret("key", &SecretValue::new("v")).await.unwrap();
        p.deny_grants_to("intruder");
        assert!(matches!(
            p.grant_access(&s.handle, "intruder").await,
            Err(ProviderError::SecretAccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn metric_stream_yields_pushed_samples() {
        let p = SimulatedProvider::new();
        let created = p
            .create(ResourceKind::ComputeService, &config(&[("name", Value::from("app"))]))
            .await
            .unwrap();
        let mut samples = p
            .stream_metric(&created.handle, "cpu_utilization", Duration::from_secs(60))
            .unwrap();

        assert_eq!(
            p.push_metric(&created.handle, "cpu_utilization", MetricSample::new(1_000, 91.0)),
            1
        );
        assert_eq!(samples.next().await, Some(MetricSample::new(1_000, 91.0)));

        p.destroy(&created.handle).await.unwrap();
        assert_eq!(samples.next().await, None);
    }

    #[tokio::test]
    async fn drift_changes_live_config() {
        let p = SimulatedProvider::new();
        let created = p
            .create(ResourceKind::CacheCluster, &config(&[("name", Value::from("cache"))]))
            .await
            .unwrap();
        p.drift(&created.handle, "node_type", Value::from("cache.t3.large"))
            .unwrap();
        let live = p.read(&created.handle).await.unwrap();
        assert_eq!(live.config["node_type"], Value::from("cache.t3.large"));
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.json");

        let p = SimulatedProvider::new();
        let db = p
            .create(ResourceKind::RelationalStore, &config(&[("name", Value::from("db"))]))
            .await
            .unwrap();
        let secret = p.put_secret("db_password", &SecretValue::new("hunter2")).await.unwrap();
        p.grant_access(&secret.handle, "db").await.unwrap();
        p.save(&path).unwrap();

        let restored = SimulatedProvider::load(&path).unwrap();
        assert!(restored.contains(&db.handle));
        assert_eq!(restored.resolve_secret(&secret.handle, "db").unwrap().expose(), "hunter2");

        // Handles keep counting from where the saved provider stopped.
        let next = restored
            .create(ResourceKind::CacheCluster, &config(&[("name", Value::from("cache"))]))
            .await
            .unwrap();
        assert_eq!(next.handle.as_str(), "cache_cluster-0003");

        // Rotation finds the restored secret by name.
        let rotated = restored.put_secret("db_password", &SecretValue::new("hunter3")).await.unwrap();
        assert_eq!(rotated.handle, secret.handle);
        assert_eq!(rotated.version, 2);
    }

    #[test]
    fn missing_snapshot_is_empty_provider() {
        let dir = tempfile::tempdir().unwrap();
        let p = SimulatedProvider::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(p.live_count(), 0);
    }
}
