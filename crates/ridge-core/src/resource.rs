//! The resource model.
//!
//! A [`Resource`] is one declared infrastructure unit: its kind, its
//! configuration, the resources it depends on, and (once active) the outputs
//! the provider reported for it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::defaults::Defaults;
use crate::error::{CoreError, CoreResult};
use crate::value::Value;

/// Unique identifier for a resource within a topology.
pub type ResourceId = String;

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_-]*$").expect("static pattern compiles")
});

/// Check that a resource id is well formed.
pub fn validate_id(id: &str) -> CoreResult<()> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(CoreError::InvalidId(id.to_string()))
    }
}

// ── Kind ──────────────────────────────────────────────────────────

/// The resource types this engine knows how to order and diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    LoadBalancer,
    ComputeService,
    RelationalStore,
    CacheCluster,
    ObjectStore,
    Secret,
    Alarm,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::ComputeService => "compute_service",
            ResourceKind::RelationalStore => "relational_store",
            ResourceKind::CacheCluster => "cache_cluster",
            ResourceKind::ObjectStore => "object_store",
            ResourceKind::Secret => "secret",
            ResourceKind::Alarm => "alarm",
        }
    }

    /// Config keys the provider cannot change in place.
    pub fn replace_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Network => &["cidr_block", "availability_zones"],
            ResourceKind::LoadBalancer => &["scheme", "subnets"],
            ResourceKind::ComputeService => &["launch_type", "subnets"],
            ResourceKind::RelationalStore => &["engine", "subnet_ids", "storage_encrypted"],
            ResourceKind::CacheCluster => &["engine", "subnet_ids"],
            ResourceKind::ObjectStore => &["bucket"],
            ResourceKind::Secret => &["secret_name"],
            ResourceKind::Alarm => &["target"],
        }
    }

    /// Whether changing `field` forces a destroy + create.
    pub fn requires_replace(&self, field: &str) -> bool {
        self.replace_fields().contains(&field)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(ResourceKind::Network),
            "load_balancer" => Ok(ResourceKind::LoadBalancer),
            "compute_service" => Ok(ResourceKind::ComputeService),
            "relational_store" => Ok(ResourceKind::RelationalStore),
            "cache_cluster" => Ok(ResourceKind::CacheCluster),
            "object_store" => Ok(ResourceKind::ObjectStore),
            "secret" => Ok(ResourceKind::Secret),
            "alarm" => Ok(ResourceKind::Alarm),
            other => Err(CoreError::UnknownKind(other.to_string())),
        }
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Where a resource is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Creating,
    Active,
    Updating,
    Destroying,
    Destroyed,
    Failed,
}

impl LifecycleState {
    /// A provider call is running against this resource.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            LifecycleState::Creating | LifecycleState::Updating | LifecycleState::Destroying
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Creating => "creating",
            LifecycleState::Active => "active",
            LifecycleState::Updating => "updating",
            LifecycleState::Destroying => "destroying",
            LifecycleState::Destroyed => "destroyed",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── Edges ─────────────────────────────────────────────────────────

/// `consumer` reads `producer.outputs[attribute_path]`.
///
/// Explicit `depends_on` entries carry an empty attribute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub consumer: ResourceId,
    pub producer: ResourceId,
    pub attribute_path: String,
}

impl DependencyEdge {
    pub fn is_explicit(&self) -> bool {
        self.attribute_path.is_empty()
    }
}

// ── Resource ──────────────────────────────────────────────────────

/// One infrastructure unit tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceId>,
    #[serde(default)]
    outputs: BTreeMap<String, Value>,
    lifecycle: LifecycleState,
}

impl Resource {
    /// Build a pending resource, folding in the process-wide defaults.
    ///
    /// `config["name"]` is set to the id when absent, and default tags are
    /// merged under `config["tags"]` with the resource's own tags winning.
    pub fn new(
        id: &str,
        kind: ResourceKind,
        mut config: BTreeMap<String, Value>,
        defaults: &Defaults,
    ) -> CoreResult<Self> {
        validate_id(id)?;

        config
            .entry("name".to_string())
            .or_insert_with(|| Value::from(id));

        let mut tags: BTreeMap<String, Value> = defaults
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        match config.remove("tags") {
            Some(Value::Map(own)) => tags.extend(own),
            Some(other) => {
                return Err(CoreError::config(
                    id,
                    format!("tags must be a table, got {other}"),
                ));
            }
            None => {}
        }
        if !tags.is_empty() {
            config.insert("tags".to_string(), Value::Map(tags));
        }

        Ok(Self {
            id: id.to_string(),
            kind,
            config,
            depends_on: BTreeSet::new(),
            outputs: BTreeMap::new(),
            lifecycle: LifecycleState::Pending,
        })
    }

    /// Rebuild a resource from persisted state.
    pub fn restore(
        id: ResourceId,
        kind: ResourceKind,
        config: BTreeMap<String, Value>,
        depends_on: BTreeSet<ResourceId>,
        outputs: BTreeMap<String, Value>,
        lifecycle: LifecycleState,
    ) -> Self {
        Self {
            id,
            kind,
            config,
            depends_on,
            outputs,
            lifecycle,
        }
    }

    /// Add explicit dependencies.
    pub fn with_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Explicit edges followed by edges inferred from `Ref` values.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: BTreeSet<DependencyEdge> = self
            .depends_on
            .iter()
            .map(|producer| DependencyEdge {
                consumer: self.id.clone(),
                producer: producer.clone(),
                attribute_path: String::new(),
            })
            .collect();
        for value in self.config.values() {
            for r in value.refs() {
                edges.insert(DependencyEdge {
                    consumer: self.id.clone(),
                    producer: r.resource.clone(),
                    attribute_path: r.attribute.clone(),
                });
            }
        }
        edges.into_iter().collect()
    }

    /// Every resource this one must wait for.
    pub fn producers(&self) -> BTreeSet<ResourceId> {
        self.edges().into_iter().map(|e| e.producer).collect()
    }

    /// Whether any config value references `producer`'s outputs.
    pub fn references(&self, producer: &str) -> bool {
        self.config
            .values()
            .any(|v| v.refs().iter().any(|r| r.resource == producer))
    }

    /// Whether a field that cannot change in place references `producer`,
    /// so replacing the producer replaces this resource too.
    pub fn replaced_with(&self, producer: &str) -> bool {
        self.config.iter().any(|(field, value)| {
            self.kind.requires_replace(field) && value.refs().iter().any(|r| r.resource == producer)
        })
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    /// Move to a non-active lifecycle state. Outputs are left untouched.
    pub fn set_lifecycle(&mut self, state: LifecycleState) {
        self.lifecycle = state;
    }

    /// Enter `Active` with the outputs the provider reported.
    ///
    /// Only allowed from `Creating` or `Updating`; outputs are read-only
    /// once the resource is active.
    pub fn mark_active(&mut self, outputs: BTreeMap<String, Value>) -> CoreResult<()> {
        match self.lifecycle {
            LifecycleState::Creating | LifecycleState::Updating => {
                self.outputs = outputs;
                self.lifecycle = LifecycleState::Active;
                Ok(())
            }
            other => Err(CoreError::OutputsSealed {
                resource: self.id.clone(),
                state: other.to_string(),
            }),
        }
    }

    /// Clear outputs ahead of a destroy + create replacement.
    pub fn reset_for_replace(&mut self) {
        self.outputs.clear();
        self.lifecycle = LifecycleState::Pending;
    }

    /// The identity the provider runtime uses when this resource reads
    /// secrets at startup.
    pub fn execution_principal(&self) -> String {
        self.config
            .get("execution_role")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-execution", self.id))
    }
}
