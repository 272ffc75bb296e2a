//! Drift between recorded and live provider state.

use std::collections::BTreeMap;

use serde::Serialize;

use ridge_core::{ResourceId, Value};

/// A config field whose live value differs from the last applied one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftField {
    pub field: String,
    /// Last value the engine applied.
    pub expected: Option<Value>,
    /// What the provider holds now.
    pub live: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Drift {
    pub resource_id: ResourceId,
    /// The provider no longer knows the handle.
    pub missing: bool,
    pub fields: Vec<DriftField>,
}

/// Result of [`Executor::refresh`](crate::Executor::refresh).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftReport {
    drifted: Vec<Drift>,
}

impl DriftReport {
    pub fn push(&mut self, drift: Drift) {
        self.drifted.push(drift);
    }

    pub fn get(&self, id: &str) -> Option<&Drift> {
        self.drifted.iter().find(|d| d.resource_id == id)
    }

    pub fn drifted(&self) -> &[Drift] {
        &self.drifted
    }

    pub fn is_empty(&self) -> bool {
        self.drifted.is_empty()
    }
}

/// Fields where `live` differs from `expected`, skipping `ignored` keys.
pub fn drifted_fields(
    expected: &BTreeMap<String, Value>,
    live: &BTreeMap<String, Value>,
    ignored: &[&str],
) -> Vec<DriftField> {
    let mut keys: Vec<&String> = expected.keys().chain(live.keys()).collect();
    keys.sort();
    keys.dedup();
    keys.into_iter()
        .filter(|k| !ignored.contains(&k.as_str()))
        .filter(|k| expected.get(*k) != live.get(*k))
        .map(|k| DriftField {
            field: k.clone(),
            expected: expected.get(k).cloned(),
            live: live.get(k).cloned(),
        })
        .collect()
}
