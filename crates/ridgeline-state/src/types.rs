//! Persisted record types.
//!
//! These are what the engine remembers between runs. `plan` diffs the
//! desired topology against [`ResourceRecord`]s; the control loops resume
//! from [`ScalingPolicyRecord`] and [`AlarmRecord`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use ridge_core::{
    AlarmSpec, AlarmState, LifecycleState, Resource, ResourceId, ResourceKind, ScalingPolicy,
    Value,
};

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Resource ──────────────────────────────────────────────────────

/// What the engine last applied for one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub kind: ResourceKind,
    /// Config as declared, references intact. Plans diff against this.
    pub declared: BTreeMap<String, Value>,
    /// Config as sent to the provider, references resolved. Drift checks
    /// compare live config against this.
    #[serde(default)]
    pub applied: BTreeMap<String, Value>,
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceId>,
    /// Provider handle once the resource exists.
    pub handle: Option<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    pub lifecycle: LifecycleState,
    /// Unix timestamp (seconds) of the last transition.
    pub updated_at: u64,
}

impl ResourceRecord {
    /// Start a record for a resource that has not been created yet.
    pub fn pending(resource: &Resource) -> Self {
        Self {
            id: resource.id.clone(),
            kind: resource.kind,
            declared: resource.config.clone(),
            applied: BTreeMap::new(),
            depends_on: resource.depends_on.clone(),
            handle: None,
            outputs: BTreeMap::new(),
            lifecycle: LifecycleState::Pending,
            updated_at: unix_now(),
        }
    }

    /// Rebuild the in-memory resource this record describes.
    pub fn to_resource(&self) -> Resource {
        Resource::restore(
            self.id.clone(),
            self.kind,
            self.declared.clone(),
            self.depends_on.clone(),
            self.outputs.clone(),
            self.lifecycle,
        )
    }

    /// Whether a provider-side resource exists for this record.
    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Move to `lifecycle` and stamp the transition time.
    pub fn transition(&mut self, lifecycle: LifecycleState) {
        self.lifecycle = lifecycle;
        self.updated_at = unix_now();
    }
}

// ── Secret ────────────────────────────────────────────────────────

/// Secret metadata. The value itself lives only with the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretRecord {
    pub name: String,
    pub handle: String,
    pub version: u32,
    /// Keyed digest (HMAC-SHA256) of the current value, used to detect rotation.
    pub value_digest: String,
    /// Principals granted read access.
    #[serde(default)]
    pub access_policy: BTreeSet<String>,
    pub updated_at: u64,
}

// ── Scaling ───────────────────────────────────────────────────────

/// Scaling policy plus the runtime state the control loop needs to resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicyRecord {
    pub target: ResourceId,
    pub policy: ScalingPolicy,
    pub current_capacity: u32,
    /// Metric timestamp (ms) of the last scaling action.
    pub last_scale_action_ms: Option<u64>,
    pub updated_at: u64,
}

// ── Alarm ─────────────────────────────────────────────────────────

/// Alarm definition and evaluation state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmRecord {
    pub spec: AlarmSpec,
    pub state: AlarmState,
    pub consecutive_breaches: u32,
    pub consecutive_oks: u32,
    /// Timestamp (ms) of the last sample evaluated.
    pub last_sample_ms: Option<u64>,
    /// Samples seen since evaluation last restarted.
    #[serde(default)]
    pub samples_since_reset: u32,
    pub updated_at: u64,
}

impl AlarmRecord {
    /// A freshly declared alarm starts with no data.
    pub fn new(spec: AlarmSpec) -> Self {
        Self {
            spec,
            state: AlarmState::InsufficientData,
            consecutive_breaches: 0,
            consecutive_oks: 0,
            last_sample_ms: None,
            samples_since_reset: 0,
            updated_at: unix_now(),
        }
    }
}
