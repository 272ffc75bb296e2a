//! Executor — applies a [`Plan`] against a provider.
//!
//! One scheduling loop drives every node of the plan. Creates, updates and
//! no-ops wait for their producers; destroys wait for the removed resources
//! that depended on them. Ready nodes are spawned onto a [`JoinSet`] and a
//! [`Semaphore`] bounds how many provider operations run at once.
//!
//! ```text
//! Executor::apply(plan)
//!   loop
//!     ├── start every node whose dependencies succeeded
//!     │     (skip dependents of failed nodes, stop starting on cancel)
//!     └── wait for one running node, record its outcome
//! ```
//!
//! References in a node's config are resolved just before it starts, from
//! the outputs its producers reported during this apply (or recorded by an
//! earlier one). Every transition is written to the state store as it
//! happens, so an interrupted apply can be resumed by planning again.
//!
//! A replaced resource is split into two nodes: a retire node that
//! destroys the old provider resource and the create that follows it.
//! Consumers whose referencing field cannot change in place are replaced
//! as well, and retire before their producer does. Other consumers are
//! updated once the new producer is active.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use ridge_core::{
    AlarmSpec, AttributeRef, Defaults, EngineConfig, LifecycleState, Resource, ResourceKind,
    ScalingPolicy, SecretBundle, Topology, Value,
};
use ridgeline_graph::DependencyGraph;
use ridgeline_provider::{
    ConfigDelta, Outputs, Provider, ProviderError, ResourceHandle, RetryPolicy,
};
use ridgeline_secrets::SecretCoordinator;
use ridgeline_state::{AlarmRecord, ResourceRecord, ScalingPolicyRecord, StateStore, unix_now};

use crate::drift::{Drift, DriftReport, drifted_fields};
use crate::error::{ExecutorError, ExecutorResult, NodeFailure};
use crate::plan::{self, Operation, Plan, PlanEntry};
use crate::report::{ApplyReport, NodeOutcome};

type Config = BTreeMap<String, Value>;
type NodeResult<T> = Result<T, NodeFailure>;

/// Drives plans against a provider and records the results.
pub struct Executor {
    provider: Arc<dyn Provider>,
    store: StateStore,
    secrets: SecretCoordinator,
    retry: RetryPolicy,
    parallelism: usize,
    cancel: Option<watch::Receiver<bool>>,
}

impl Executor {
    pub fn new(provider: Arc<dyn Provider>, store: StateStore) -> Self {
        let secrets = SecretCoordinator::new(provider.clone(), store.clone());
        Self {
            provider,
            store,
            secrets,
            retry: RetryPolicy::default(),
            parallelism: EngineConfig::default().parallelism,
            cancel: None,
        }
    }

    /// Build an executor with the `[engine]` settings of a topology.
    pub fn from_config(provider: Arc<dyn Provider>, store: StateStore, config: &EngineConfig) -> Self {
        Self::new(provider, store)
            .with_parallelism(config.parallelism)
            .with_retry(RetryPolicy::from_config(&config.retry))
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.secrets = self.secrets.with_retry(retry);
        self
    }

    /// Stop starting new nodes once `cancel` reads `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn secrets(&self) -> &SecretCoordinator {
        &self.secrets
    }

    /// Diff `desired` against the recorded state.
    pub fn plan(&self, desired: &Topology) -> ExecutorResult<Plan> {
        let records = self.store.list_resources()?;
        Ok(plan::plan(desired, &records)?)
    }

    /// Refresh recorded state from the provider, then plan with any drift
    /// folded in.
    pub async fn plan_with_drift(&self, desired: &Topology) -> ExecutorResult<(Plan, DriftReport)> {
        let drift = self.refresh().await?;
        let records = self.store.list_resources()?;
        let plan = plan::plan_with_drift(desired, &records, &drift)?;
        Ok((plan, drift))
    }

    /// Read every active resource back from the provider and record where
    /// its live config has drifted from what was last applied.
    ///
    /// Drifted fields are written into the record's applied config, so the
    /// next update sends exactly the fields needed to restore them. A
    /// handle the provider no longer knows is cleared, which plans a
    /// create.
    pub async fn refresh(&self) -> ExecutorResult<DriftReport> {
        let mut report = DriftReport::default();
        for mut record in self.store.list_resources()? {
            if record.kind == ResourceKind::Secret || record.lifecycle != LifecycleState::Active {
                continue;
            }
            let Some(handle) = record.handle.clone() else {
                continue;
            };
            let handle = ResourceHandle(handle);
            match self.retry.run("read", || self.provider.read(&handle)).await {
                Ok(live) => {
                    // Autoscaling owns the task count of scaled services.
                    let ignored: &[&str] = if record.declared.contains_key("scaling") {
                        &["desired_count"]
                    } else {
                        &[]
                    };
                    let fields = drifted_fields(&record.applied, &live.config, ignored);
                    if fields.is_empty() {
                        continue;
                    }
                    warn!(resource = %record.id, fields = fields.len(), "drift detected");
                    for f in &fields {
                        match &f.live {
                            Some(v) => record.applied.insert(f.field.clone(), v.clone()),
                            None => record.applied.remove(&f.field),
                        };
                    }
                    self.store.put_resource(&record)?;
                    report.push(Drift {
                        resource_id: record.id.clone(),
                        missing: false,
                        fields,
                    });
                }
                Err(ProviderError::NotFound(_)) => {
                    warn!(resource = %record.id, %handle, "resource missing from provider");
                    record.handle = None;
                    record.outputs.clear();
                    record.transition(LifecycleState::Pending);
                    self.store.put_resource(&record)?;
                    report.push(Drift {
                        resource_id: record.id.clone(),
                        missing: true,
                        fields: Vec::new(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }

    /// Destroy every recorded resource in teardown order.
    pub async fn destroy_all(&self) -> ExecutorResult<ApplyReport> {
        let desired = Topology::empty(Defaults::default());
        let plan = self.plan(&desired)?;
        self.apply(plan, &desired).await
    }

    /// Apply `plan`, which must have been computed for `desired`.
    ///
    /// Structural problems return an error before any provider call.
    /// Per-node failures do not: they are reported in the [`ApplyReport`]
    /// while independent branches carry on. Nothing is rolled back.
    pub async fn apply(&self, plan: Plan, desired: &Topology) -> ExecutorResult<ApplyReport> {
        let records: HashMap<String, ResourceRecord> = self
            .store
            .list_resources()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let Schedule {
            mut nodes,
            graph,
            position,
        } = self.build_nodes(plan, desired, &records)?;
        let kinds: HashMap<&str, ResourceKind> = desired
            .resources()
            .iter()
            .map(|r| (r.id.as_str(), r.kind))
            .collect();

        let mut outputs: HashMap<String, Outputs> = records
            .values()
            .filter(|r| r.lifecycle == LifecycleState::Active)
            .map(|r| (r.id.clone(), r.outputs.clone()))
            .collect();

        let ctx = NodeContext {
            provider: self.provider.clone(),
            store: self.store.clone(),
            secrets: self.secrets.clone(),
            retry: self.retry,
            bundle: Arc::new(desired.secrets().clone()),
            cancel: self.cancel.clone(),
        };
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut running: JoinSet<NodeRun> = JoinSet::new();
        let mut task_nodes = HashMap::new();

        info!(nodes = nodes.len(), parallelism = self.parallelism, "apply started");

        loop {
            self.start_ready(&mut nodes, &kinds, &outputs, |idx, job| {
                let ctx = ctx.clone();
                let semaphore = semaphore.clone();
                let handle = running.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    run_job(ctx, job).await
                });
                task_nodes.insert(handle.id(), idx);
            });

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let (idx, outcome, produced) = match joined {
                Ok((id, NodeRun::Finished(outcome, produced))) => (task_nodes[&id], outcome, produced),
                Ok((id, NodeRun::NeedsReplacement(fields))) => {
                    let idx = task_nodes[&id];
                    let resource_id = nodes[idx].entry.resource_id.clone();
                    if nodes[idx].retire.is_none() {
                        info!(resource = %resource_id, ?fields, "provider requires replacement");
                        nodes[idx].status = Status::Waiting;
                        if schedule_replacement(&mut nodes, &graph, &position, idx).is_some() {
                            continue;
                        }
                    }
                    let failure = NodeFailure::Provider(ProviderError::ReplacementRequired { fields });
                    error!(resource = %resource_id, error = %failure, "node failed");
                    (idx, failed(&resource_id, Operation::Update, failure), None)
                }
                Err(e) => {
                    let idx = task_nodes[&e.id()];
                    error!(resource = %nodes[idx].entry.resource_id, error = %e, "node task aborted");
                    let outcome = NodeOutcome {
                        resource_id: nodes[idx].entry.resource_id.clone(),
                        operation: nodes[idx].entry.operation,
                        state: LifecycleState::Failed,
                        failure: Some(NodeFailure::Lifecycle(format!("node task aborted: {e}"))),
                    };
                    (idx, outcome, None)
                }
            };
            if let Some(produced) = produced {
                outputs.insert(outcome.resource_id.clone(), produced);
            }
            nodes[idx].status = Status::Done(outcome);
        }

        let outcomes = nodes
            .into_iter()
            .filter(|n| n.role == Role::Primary)
            .map(|n| match n.status {
                Status::Done(outcome) => outcome,
                // The loop only exits once every node has finished.
                Status::Waiting | Status::Running => NodeOutcome {
                    resource_id: n.entry.resource_id,
                    operation: n.entry.operation,
                    state: LifecycleState::Pending,
                    failure: Some(NodeFailure::Cancelled),
                },
            })
            .collect();
        let report = ApplyReport::new(outcomes);
        info!(%report, "apply finished");
        Ok(report)
    }

    fn build_nodes(
        &self,
        plan: Plan,
        desired: &Topology,
        records: &HashMap<String, ResourceRecord>,
    ) -> ExecutorResult<Schedule> {
        let entries = plan.into_entries();
        let position: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.resource_id.clone(), i))
            .collect();
        let graph = DependencyGraph::build(desired.resources())?;

        let removed: BTreeMap<&str, Resource> = entries
            .iter()
            .filter(|e| e.operation == Operation::Destroy)
            .filter_map(|e| records.get(&e.resource_id))
            .map(|r| (r.id.as_str(), r.to_resource()))
            .collect();

        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = entry.resource_id.as_str();
            let (resource, waits_for) = if entry.operation == Operation::Destroy {
                // A removed resource outlives every removed resource using it.
                let waits: Vec<usize> = removed
                    .values()
                    .filter(|r| r.producers().contains(id))
                    .filter_map(|r| position.get(&r.id).copied())
                    .collect();
                (None, waits)
            } else {
                let resource = desired
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ExecutorError::PlanMismatch(id.to_string()))?;
                let waits = graph
                    .producers_of(id)
                    .into_iter()
                    .map(|p| {
                        position
                            .get(p)
                            .copied()
                            .ok_or_else(|| ExecutorError::PlanMismatch(p.to_string()))
                    })
                    .collect::<ExecutorResult<Vec<_>>>()?;
                (Some(resource), waits)
            };
            let record = records.get(id).cloned();
            nodes.push(Node {
                entry,
                resource,
                record,
                waits_for,
                status: Status::Waiting,
                role: Role::Primary,
                retire: None,
            });
        }

        let replaced: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.entry.operation == Operation::Update && n.entry.requires_replace())
            .map(|(i, _)| i)
            .collect();
        for idx in replaced {
            schedule_replacement(&mut nodes, &graph, &position, idx);
        }

        Ok(Schedule {
            nodes,
            graph,
            position,
        })
    }

    /// Start (or settle inline) every waiting node whose dependencies are
    /// done. Repeats until a pass changes nothing, since settling a node
    /// can make others ready.
    fn start_ready<F>(
        &self,
        nodes: &mut [Node],
        kinds: &HashMap<&str, ResourceKind>,
        outputs: &HashMap<String, Outputs>,
        mut spawn: F,
    ) where
        F: FnMut(usize, Job),
    {
        let mut progressed = true;
        while progressed {
            progressed = false;
            for idx in 0..nodes.len() {
                if !matches!(nodes[idx].status, Status::Waiting) {
                    continue;
                }
                match dependency_state(nodes, idx) {
                    DepState::Pending => continue,
                    DepState::Blocked(failure) => {
                        let retired = was_retired(nodes, idx);
                        self.skip(&mut nodes[idx], failure, retired);
                        progressed = true;
                        continue;
                    }
                    DepState::Failed(failure) => {
                        let node = &mut nodes[idx];
                        error!(resource = %node.entry.resource_id, error = %failure, "node failed");
                        node.status =
                            Status::Done(failed(&node.entry.resource_id, node.entry.operation, failure));
                        progressed = true;
                        continue;
                    }
                    DepState::Ready => {}
                }
                if self.is_cancelled() {
                    let retired = was_retired(nodes, idx);
                    self.skip(&mut nodes[idx], NodeFailure::Cancelled, retired);
                    progressed = true;
                    continue;
                }

                progressed = true;
                match prepare(&mut nodes[idx], kinds, outputs) {
                    Prepared::Settled(outcome) => {
                        nodes[idx].status = Status::Done(outcome);
                    }
                    Prepared::Run(job) => {
                        let node = &mut nodes[idx];
                        debug!(
                            resource = %node.entry.resource_id,
                            op = %node.entry.operation,
                            reason = %node.entry.reason,
                            "starting node"
                        );
                        node.status = Status::Running;
                        spawn(idx, job);
                    }
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Report a node that will never be attempted. `retired` means its old
    /// provider resource is already gone.
    fn skip(&self, node: &mut Node, failure: NodeFailure, retired: bool) {
        let id = node.entry.resource_id.clone();
        let state = match &node.record {
            Some(_) if retired => LifecycleState::Pending,
            Some(record) => record.lifecycle,
            None => {
                // Keep never-attempted creates visible in state as pending.
                if let Some(resource) = &node.resource {
                    if let Err(e) = self.store.put_resource(&ResourceRecord::pending(resource)) {
                        warn!(resource = %id, error = %e, "failed to record pending resource");
                    }
                }
                LifecycleState::Pending
            }
        };
        warn!(resource = %id, reason = %failure, "node skipped");
        node.status = Status::Done(NodeOutcome {
            resource_id: id,
            operation: node.entry.operation,
            state,
            failure: Some(failure),
        });
    }
}

// ── Scheduling state ──────────────────────────────────────────────

struct Schedule {
    nodes: Vec<Node>,
    graph: DependencyGraph,
    /// Index of each resource's primary node.
    position: HashMap<String, usize>,
}

struct Node {
    entry: PlanEntry,
    /// Desired resource; `None` for destroys.
    resource: Option<Resource>,
    record: Option<ResourceRecord>,
    /// Nodes that must succeed before this one starts.
    waits_for: Vec<usize>,
    status: Status,
    role: Role,
    /// Retire node destroying the resource this node replaces.
    retire: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// One per plan entry; reported.
    Primary,
    /// Destroys the old provider resource ahead of a replacement. Its
    /// outcome folds into the primary node's.
    Retire,
}

enum Status {
    Waiting,
    Running,
    Done(NodeOutcome),
}

enum DepState {
    Ready,
    Pending,
    Blocked(NodeFailure),
    /// The node's own retire step failed.
    Failed(NodeFailure),
}

/// Whether the retire step of the node at `idx` has destroyed the old
/// resource.
fn was_retired(nodes: &[Node], idx: usize) -> bool {
    nodes[idx].retire.is_some_and(|r| {
        matches!(&nodes[r].status, Status::Done(o) if o.failure.is_none())
    })
}

fn dependency_state(nodes: &[Node], idx: usize) -> DepState {
    let mut ready = true;
    for &dep in &nodes[idx].waits_for {
        match &nodes[dep].status {
            Status::Done(o) => match &o.failure {
                None => {}
                Some(NodeFailure::Cancelled) => return DepState::Blocked(NodeFailure::Cancelled),
                Some(failure)
                    if nodes[idx].retire == Some(dep)
                        && !matches!(failure, NodeFailure::DependencyFailed { .. }) =>
                {
                    return DepState::Failed(failure.clone());
                }
                // Name the node that actually failed.
                Some(NodeFailure::DependencyFailed { upstream }) => {
                    return DepState::Blocked(NodeFailure::DependencyFailed {
                        upstream: upstream.clone(),
                    });
                }
                Some(_) => {
                    return DepState::Blocked(NodeFailure::DependencyFailed {
                        upstream: o.resource_id.clone(),
                    });
                }
            },
            Status::Waiting | Status::Running => ready = false,
        }
    }
    if ready { DepState::Ready } else { DepState::Pending }
}

/// Split the node at `idx` into a retire node and the create that follows
/// it, and return the retire node.
///
/// The retire node waits for every removed resource still using this one
/// and for the retire nodes of consumers that must be replaced too: those
/// planned for replacement anyway and those referencing this resource from
/// a field that cannot change in place. Returns `None` when there is no
/// live resource to retire.
fn schedule_replacement(
    nodes: &mut Vec<Node>,
    graph: &DependencyGraph,
    position: &HashMap<String, usize>,
    idx: usize,
) -> Option<usize> {
    if let Some(retire) = nodes[idx].retire {
        return Some(retire);
    }
    let record = nodes[idx].record.clone().filter(ResourceRecord::has_handle)?;
    let id = record.id.clone();

    let mut waits_for: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.role == Role::Primary && n.entry.operation == Operation::Destroy)
        .filter(|(_, n)| {
            n.record
                .as_ref()
                .is_some_and(|r| r.to_resource().producers().contains(id.as_str()))
        })
        .map(|(j, _)| j)
        .collect();

    let retire = nodes.len();
    nodes.push(Node {
        entry: PlanEntry {
            resource_id: id.clone(),
            kind: record.kind,
            operation: Operation::Destroy,
            reason: "replaced".to_string(),
            changes: Vec::new(),
        },
        resource: None,
        record: Some(record),
        waits_for: Vec::new(),
        status: Status::Waiting,
        role: Role::Retire,
        retire: None,
    });
    nodes[idx].retire = Some(retire);
    nodes[idx].waits_for.push(retire);

    for consumer in graph.consumers_of(&id) {
        let Some(&c) = position.get(consumer) else {
            continue;
        };
        let forced = nodes[c]
            .resource
            .as_ref()
            .is_some_and(|r| r.replaced_with(&id));
        if !forced && !nodes[c].entry.requires_replace() {
            continue;
        }
        if let Some(consumer_retire) = schedule_replacement(nodes, graph, position, c) {
            debug!(resource = %consumer, upstream = %id, "consumer replaced with its producer");
            waits_for.push(consumer_retire);
            let entry = &mut nodes[c].entry;
            if entry.operation == Operation::NoOp {
                entry.operation = Operation::Update;
                entry.reason = format!("replaced with {id}");
            }
        }
    }
    nodes[retire].waits_for = waits_for;
    Some(retire)
}

/// Work handed to a node task.
enum Job {
    Create {
        resource: Resource,
        resolved: Config,
        grants: Vec<String>,
        /// The old resource was retired; reported as an update.
        replacing: bool,
    },
    Update {
        resource: Resource,
        resolved: Config,
        record: ResourceRecord,
        grants: Vec<String>,
    },
    Destroy {
        record: ResourceRecord,
    },
    Retire {
        record: ResourceRecord,
    },
}

/// What a node task reports back to the scheduling loop.
enum NodeRun {
    Finished(NodeOutcome, Option<Outputs>),
    /// The provider refused an in-place update.
    NeedsReplacement(Vec<String>),
}

enum Prepared {
    /// Finished without a provider call.
    Settled(NodeOutcome),
    Run(Job),
}

/// Resolve a ready node's references and decide what to run.
fn prepare(
    node: &mut Node,
    kinds: &HashMap<&str, ResourceKind>,
    outputs: &HashMap<String, Outputs>,
) -> Prepared {
    let id = node.entry.resource_id.clone();
    let operation = node.entry.operation;

    if node.role == Role::Retire {
        return match node.record.clone() {
            Some(record) => Prepared::Run(Job::Retire { record }),
            None => Prepared::Settled(success(&id, operation, LifecycleState::Destroyed)),
        };
    }
    if operation == Operation::Destroy {
        return match node.record.clone() {
            Some(record) => Prepared::Run(Job::Destroy { record }),
            None => Prepared::Settled(success(&id, operation, LifecycleState::Destroyed)),
        };
    }

    let Some(resource) = node.resource.clone() else {
        let failure = NodeFailure::Lifecycle("no desired resource for node".to_string());
        return Prepared::Settled(failed(&id, operation, failure));
    };
    let resolved = match resolve_config(&resource.config, outputs) {
        Ok(resolved) => resolved,
        Err(r) => {
            return Prepared::Settled(failed(
                &id,
                operation,
                NodeFailure::UnresolvedReference(r.to_string()),
            ));
        }
    };
    let grants = secret_handles(&resource, kinds, outputs);

    if node.retire.is_some() {
        let mut resource = resource;
        resource.reset_for_replace();
        return Prepared::Run(Job::Create {
            resource,
            resolved,
            grants,
            replacing: true,
        });
    }

    match (operation, node.record.clone()) {
        (Operation::NoOp, Some(record)) => {
            if record.applied == resolved {
                return Prepared::Settled(success(&id, operation, LifecycleState::Active));
            }
            info!(resource = %id, "upstream outputs changed, promoting to update");
            node.entry.operation = Operation::Update;
            node.entry.reason = "upstream outputs changed".to_string();
            Prepared::Run(Job::Update {
                resource,
                resolved,
                record,
                grants,
            })
        }
        (Operation::Update, Some(record)) if record.has_handle() => Prepared::Run(Job::Update {
            resource,
            resolved,
            record,
            grants,
        }),
        _ => {
            node.entry.operation = Operation::Create;
            Prepared::Run(Job::Create {
                resource,
                resolved,
                grants,
                replacing: false,
            })
        }
    }
}

fn resolve_config(config: &Config, outputs: &HashMap<String, Outputs>) -> Result<Config, AttributeRef> {
    let lookup = |r: &AttributeRef| outputs.get(&r.resource).and_then(|o| r.lookup(o));
    config
        .iter()
        .map(|(k, v)| v.resolve(&lookup).map(|v| (k.clone(), v)))
        .collect()
}

/// Handles of the secrets `resource` references.
fn secret_handles(
    resource: &Resource,
    kinds: &HashMap<&str, ResourceKind>,
    outputs: &HashMap<String, Outputs>,
) -> Vec<String> {
    let handles: BTreeSet<String> = resource
        .config
        .values()
        .flat_map(|v| v.refs())
        .filter(|r| kinds.get(r.resource.as_str()) == Some(&ResourceKind::Secret))
        .filter_map(|r| outputs.get(&r.resource)?.get("handle")?.as_str().map(str::to_string))
        .collect();
    handles.into_iter().collect()
}

fn success(id: &str, operation: Operation, state: LifecycleState) -> NodeOutcome {
    NodeOutcome {
        resource_id: id.to_string(),
        operation,
        state,
        failure: None,
    }
}

fn failed(id: &str, operation: Operation, failure: NodeFailure) -> NodeOutcome {
    NodeOutcome {
        resource_id: id.to_string(),
        operation,
        state: LifecycleState::Failed,
        failure: Some(failure),
    }
}

// ── Node tasks ────────────────────────────────────────────────────

#[derive(Clone)]
struct NodeContext {
    provider: Arc<dyn Provider>,
    store: StateStore,
    secrets: SecretCoordinator,
    retry: RetryPolicy,
    bundle: Arc<SecretBundle>,
    cancel: Option<watch::Receiver<bool>>,
}

async fn run_job(ctx: NodeContext, job: Job) -> NodeRun {
    let (id, operation) = match &job {
        Job::Create {
            resource, replacing, ..
        } => {
            let op = if *replacing { Operation::Update } else { Operation::Create };
            (resource.id.clone(), op)
        }
        Job::Update { resource, .. } => (resource.id.clone(), Operation::Update),
        Job::Destroy { record } | Job::Retire { record } => (record.id.clone(), Operation::Destroy),
    };
    let in_place = matches!(job, Job::Update { .. });

    // Queued behind the semaphore while the apply was cancelled.
    if ctx.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
        let state = match &job {
            Job::Create { .. } => LifecycleState::Pending,
            Job::Update { record, .. } | Job::Destroy { record } | Job::Retire { record } => {
                record.lifecycle
            }
        };
        let outcome = NodeOutcome {
            resource_id: id,
            operation,
            state,
            failure: Some(NodeFailure::Cancelled),
        };
        return NodeRun::Finished(outcome, None);
    }

    let result = match job {
        Job::Create {
            resource,
            resolved,
            grants,
            ..
        } => ctx.create(resource, resolved, &grants).await.map(Some),
        Job::Update {
            resource,
            resolved,
            record,
            grants,
        } => ctx.update(resource, resolved, record, &grants).await.map(Some),
        Job::Destroy { record } => ctx.destroy(record).await.map(|()| None),
        Job::Retire { record } => ctx.retire(record).await.map(|()| None),
    };

    match result {
        Ok(produced) => {
            let state = if operation == Operation::Destroy {
                LifecycleState::Destroyed
            } else {
                LifecycleState::Active
            };
            info!(resource = %id, op = %operation, "node succeeded");
            NodeRun::Finished(success(&id, operation, state), produced)
        }
        Err(NodeFailure::Provider(ProviderError::ReplacementRequired { fields })) if in_place => {
            NodeRun::NeedsReplacement(fields)
        }
        Err(failure) => {
            error!(resource = %id, op = %operation, error = %failure, "node failed");
            NodeRun::Finished(failed(&id, operation, failure), None)
        }
    }
}

impl NodeContext {
    async fn create(&self, mut resource: Resource, resolved: Config, grants: &[String]) -> NodeResult<Outputs> {
        let mut record = ResourceRecord::pending(&resource);
        record.transition(LifecycleState::Creating);
        self.store.put_resource(&record)?;
        resource.set_lifecycle(LifecycleState::Creating);

        match self.provision(&resource, &resolved, grants).await {
            Ok((handle, outputs)) => self.activate(resource, record, handle, resolved, outputs),
            Err(failure) => Err(self.mark_failed(record, failure)),
        }
    }

    async fn update(
        &self,
        mut resource: Resource,
        resolved: Config,
        mut record: ResourceRecord,
        grants: &[String],
    ) -> NodeResult<Outputs> {
        record.declared = resource.config.clone();
        record.depends_on = resource.depends_on.clone();
        record.transition(LifecycleState::Updating);
        self.store.put_resource(&record)?;
        resource.set_lifecycle(LifecycleState::Updating);

        match self.update_in_place(&resource, &record, &resolved, grants).await {
            Ok((handle, outputs)) => self.activate(resource, record, handle, resolved, outputs),
            // Nothing changed provider-side; the scheduler retires and
            // recreates the node.
            Err(failure @ NodeFailure::Provider(ProviderError::ReplacementRequired { .. })) => {
                Err(failure)
            }
            Err(failure) => Err(self.mark_failed(record, failure)),
        }
    }

    async fn update_in_place(
        &self,
        resource: &Resource,
        record: &ResourceRecord,
        resolved: &Config,
        grants: &[String],
    ) -> NodeResult<(String, Outputs)> {
        if resource.kind == ResourceKind::Secret {
            return self.provision(resource, resolved, grants).await;
        }
        let handle = record
            .handle
            .clone()
            .ok_or_else(|| NodeFailure::Lifecycle(format!("{} has no handle", record.id)))?;

        let delta = ConfigDelta::between(&record.applied, resolved);
        if delta.is_empty() {
            return Ok((handle, record.outputs.clone()));
        }
        self.secrets.authorize_consumer(resource, grants).await?;
        let provider_handle = ResourceHandle::from(handle.as_str());
        let mut outputs = self
            .retry
            .run("update", || self.provider.update(&provider_handle, &delta))
            .await?;
        outputs.insert("handle".to_string(), Value::from(handle.as_str()));
        Ok((handle, outputs))
    }

    /// Destroy the provider-side resource ahead of its replacement. The
    /// record stays, without a handle, until the replacement is created.
    ///
    /// Scaling and alarm state belonged to the old resource and is dropped;
    /// the replacement starts from its declared capacity.
    async fn retire(&self, mut record: ResourceRecord) -> NodeResult<()> {
        info!(resource = %record.id, "retiring resource for replacement");
        record.transition(LifecycleState::Destroying);
        self.store.put_resource(&record)?;
        if let Err(failure) = self.release(&record).await {
            return Err(self.mark_failed(record, failure));
        }
        record.handle = None;
        record.outputs.clear();
        record.transition(LifecycleState::Pending);
        self.store.put_resource(&record)?;
        self.store.delete_scaling_policy(&record.id)?;
        self.store.delete_alarm(&record.id)?;
        Ok(())
    }

    async fn destroy(&self, mut record: ResourceRecord) -> NodeResult<()> {
        if record.has_handle() {
            record.transition(LifecycleState::Destroying);
            self.store.put_resource(&record)?;
            if let Err(failure) = self.release(&record).await {
                return Err(self.mark_failed(record, failure));
            }
        }
        self.store.delete_resource(&record.id)?;
        self.store.delete_scaling_policy(&record.id)?;
        self.store.delete_alarm(&record.id)?;
        Ok(())
    }

    /// Create the provider-side resource (or store the secret) and return
    /// its handle and outputs.
    async fn provision(
        &self,
        resource: &Resource,
        resolved: &Config,
        grants: &[String],
    ) -> NodeResult<(String, Outputs)> {
        if resource.kind == ResourceKind::Secret {
            let outputs = self.secrets.materialize(resource, &self.bundle).await?;
            let handle = outputs
                .get("handle")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| NodeFailure::Secret("secret has no handle".to_string()))?;
            return Ok((handle, outputs));
        }

        self.secrets.authorize_consumer(resource, grants).await?;
        let created = self
            .retry
            .run("create", || self.provider.create(resource.kind, resolved))
            .await?;
        let mut outputs = created.outputs;
        outputs.insert("handle".to_string(), Value::from(created.handle.as_str()));
        Ok((created.handle.0, outputs))
    }

    /// Tear down the provider-side resource behind `record`. A handle the
    /// provider no longer knows counts as already gone.
    async fn release(&self, record: &ResourceRecord) -> NodeResult<()> {
        let Some(handle) = record.handle.as_deref() else {
            return Ok(());
        };
        if record.kind == ResourceKind::Secret {
            let name = record
                .applied
                .get("secret_name")
                .and_then(Value::as_str)
                .unwrap_or(&record.id);
            self.secrets.forget(name)?;
            return Ok(());
        }
        let handle = ResourceHandle::from(handle);
        match self.retry.run("destroy", || self.provider.destroy(&handle)).await {
            Ok(()) => Ok(()),
            Err(ProviderError::NotFound(_)) => {
                debug!(resource = %record.id, %handle, "already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn activate(
        &self,
        mut resource: Resource,
        mut record: ResourceRecord,
        handle: String,
        resolved: Config,
        outputs: Outputs,
    ) -> NodeResult<Outputs> {
        resource.mark_active(outputs.clone())?;
        record.handle = Some(handle);
        record.applied = resolved;
        record.outputs = outputs.clone();
        record.transition(LifecycleState::Active);
        self.store.put_resource(&record)?;
        self.register_control_state(&resource)?;
        Ok(outputs)
    }

    fn mark_failed(&self, mut record: ResourceRecord, failure: NodeFailure) -> NodeFailure {
        record.transition(LifecycleState::Failed);
        if let Err(e) = self.store.put_resource(&record) {
            warn!(resource = %record.id, error = %e, "failed to record failure");
        }
        failure
    }

    /// Seed the scaling and alarm records the control loops resume from,
    /// and drop the ones the resource no longer declares.
    fn register_control_state(&self, resource: &Resource) -> NodeResult<()> {
        match ScalingPolicy::from_resource(resource)? {
            Some(policy) => {
                let existing = self.store.get_scaling_policy(&resource.id)?;
                let current = match &existing {
                    Some(existing) => existing.current_capacity,
                    None => resource
                        .config
                        .get("desired_count")
                        .and_then(Value::as_i64)
                        .and_then(|n| u32::try_from(n).ok())
                        .unwrap_or(policy.min_capacity),
                };
                let last = existing.and_then(|r| r.last_scale_action_ms);
                self.store.put_scaling_policy(&ScalingPolicyRecord {
                    target: resource.id.clone(),
                    current_capacity: policy.clamp(current),
                    policy,
                    last_scale_action_ms: last,
                    updated_at: unix_now(),
                })?;
            }
            None => {
                if self.store.delete_scaling_policy(&resource.id)? {
                    info!(resource = %resource.id, "scaling policy removed");
                }
            }
        }

        if resource.kind == ResourceKind::Alarm {
            let spec = AlarmSpec::from_resource(resource)?;
            let record = match self.store.get_alarm(&resource.id)? {
                Some(mut existing) => {
                    existing.spec = spec;
                    existing
                }
                None => AlarmRecord::new(spec),
            };
            self.store.put_alarm(&record)?;
        } else if self.store.delete_alarm(&resource.id)? {
            info!(resource = %resource.id, "alarm record removed");
        }
        Ok(())
    }
}
