//! Diffing desired topology against recorded state.
//!
//! A [`Plan`] lists one [`PlanEntry`] per resource: creates, updates and
//! no-ops in creation order, followed by destroys in teardown order. It is
//! computed without touching the provider, so structural problems (cycles,
//! unknown dependencies) surface before anything is changed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::debug;

use ridge_core::{LifecycleState, ResourceId, ResourceKind, Topology, Value};
use ridgeline_graph::DependencyGraph;
use ridgeline_state::ResourceRecord;

use crate::drift::DriftReport;
use crate::error::PlanResult;

/// What the executor will do to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Destroy => "destroy",
            Operation::NoOp => "no-op",
        })
    }
}

/// One changed config field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    /// The provider cannot change this field in place.
    pub requires_replace: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEntry {
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub operation: Operation,
    pub reason: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FieldChange>,
}

impl PlanEntry {
    /// Whether the update has to destroy and recreate the resource.
    pub fn requires_replace(&self) -> bool {
        self.changes.iter().any(|c| c.requires_replace)
    }
}

/// Counts per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub destroy: usize,
    pub no_op: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to destroy, {} unchanged",
            self.create, self.update, self.destroy, self.no_op
        )
    }
}

/// An ordered, immutable set of operations. Consumed by
/// [`Executor::apply`](crate::Executor::apply).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.resource_id == id)
    }

    pub fn operation_of(&self, id: &str) -> Option<Operation> {
        self.get(id).map(|e| e.operation)
    }

    /// Whether applying this plan would change nothing.
    pub fn is_noop(&self) -> bool {
        self.entries.iter().all(|e| e.operation == Operation::NoOp)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary::default();
        for e in &self.entries {
            match e.operation {
                Operation::Create => s.create += 1,
                Operation::Update => s.update += 1,
                Operation::Destroy => s.destroy += 1,
                Operation::NoOp => s.no_op += 1,
            }
        }
        s
    }

    pub(crate) fn into_entries(self) -> Vec<PlanEntry> {
        self.entries
    }
}

/// Diff `desired` against the `current` records.
///
/// - absent from current (or never created): `Create`
/// - absent from desired: `Destroy`
/// - present in both with differing config: `Update`
/// - otherwise: `NoOp`
///
/// A record left `Failed` (or mid-operation by a crash) is re-planned:
/// without a provider handle it is created again, with one it is updated.
pub fn plan(desired: &Topology, current: &[ResourceRecord]) -> PlanResult<Plan> {
    let graph = DependencyGraph::build(desired.resources())?;
    let order = graph.creation_order()?;
    let records: HashMap<&str, &ResourceRecord> =
        current.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut entries = Vec::with_capacity(order.len() + current.len());
    for id in &order {
        // The graph was built from these resources.
        let Some(resource) = desired.get(id) else {
            continue;
        };
        let entry = match records.get(id.as_str()) {
            None => entry(resource.id.clone(), resource.kind, Operation::Create, "not in current state"),
            Some(record) => diff_existing(resource.kind, &resource.config, record),
        };
        entries.push(entry);
    }

    let removed: Vec<_> = current
        .iter()
        .filter(|r| desired.get(&r.id).is_none())
        .map(ResourceRecord::to_resource)
        .collect();
    if !removed.is_empty() {
        let teardown = DependencyGraph::build_allowing_missing(&removed)?.teardown_order()?;
        for id in teardown {
            if let Some(record) = records.get(id.as_str()) {
                entries.push(entry(
                    id.clone(),
                    record.kind,
                    Operation::Destroy,
                    "not in desired topology",
                ));
            }
        }
    }

    let plan = Plan { entries };
    debug!(summary = %plan.summary(), "plan computed");
    Ok(plan)
}

/// Like [`plan`], but resources whose live config drifted from what was
/// last applied are updated even when their declared config is unchanged,
/// and resources missing from the provider are created again.
pub fn plan_with_drift(
    desired: &Topology,
    current: &[ResourceRecord],
    drift: &DriftReport,
) -> PlanResult<Plan> {
    let mut plan = plan(desired, current)?;
    for entry in &mut plan.entries {
        if entry.operation != Operation::NoOp {
            continue;
        }
        let Some(d) = drift.get(&entry.resource_id) else {
            continue;
        };
        if d.missing {
            entry.operation = Operation::Create;
            entry.reason = "missing from provider".to_string();
        } else {
            entry.operation = Operation::Update;
            entry.reason = "drift detected".to_string();
            entry.changes = d
                .fields
                .iter()
                .map(|c| FieldChange {
                    field: c.field.clone(),
                    before: c.live.clone(),
                    after: c.expected.clone(),
                    requires_replace: entry.kind.requires_replace(&c.field),
                })
                .collect();
        }
    }
    Ok(plan)
}

fn entry(id: ResourceId, kind: ResourceKind, operation: Operation, reason: &str) -> PlanEntry {
    PlanEntry {
        resource_id: id,
        kind,
        operation,
        reason: reason.to_string(),
        changes: Vec::new(),
    }
}

fn diff_existing(
    kind: ResourceKind,
    desired: &BTreeMap<String, Value>,
    record: &ResourceRecord,
) -> PlanEntry {
    let id = record.id.clone();
    if !record.has_handle() {
        let reason = match record.lifecycle {
            LifecycleState::Failed => "previous apply failed before creation",
            _ => "not yet created",
        };
        return entry(id, kind, Operation::Create, reason);
    }

    let mut changes = diff_config(kind, &record.declared, desired);
    if kind != record.kind {
        changes.insert(
            0,
            FieldChange {
                field: "kind".to_string(),
                before: Some(Value::from(record.kind.as_str())),
                after: Some(Value::from(kind.as_str())),
                requires_replace: true,
            },
        );
    }

    let reason = match record.lifecycle {
        LifecycleState::Failed => "previous apply failed".to_string(),
        state if state.is_in_flight() => format!("interrupted while {state}"),
        _ if changes.is_empty() => return entry(id, kind, Operation::NoOp, "up to date"),
        _ => {
            let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
            format!("config changed: {}", fields.join(", "))
        }
    };
    PlanEntry {
        resource_id: id,
        kind,
        operation: Operation::Update,
        reason,
        changes,
    }
}

/// Field-level diff, in key order.
pub fn diff_config(
    kind: ResourceKind,
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
) -> Vec<FieldChange> {
    let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
    keys.sort();
    keys.dedup();
    keys.into_iter()
        .filter(|k| before.get(*k) != after.get(*k))
        .map(|k| FieldChange {
            field: k.clone(),
            before: before.get(k).cloned(),
            after: after.get(k).cloned(),
            requires_replace: kind.requires_replace(k),
        })
        .collect()
}
