//! End-to-end apply scenarios against the simulated provider.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use ridge_core::topology::MEDIA_STACK_TOML;
use ridge_core::{AlarmState, DigestKey, LifecycleState, Topology, Value};
use ridgeline_executor::{Executor, ExecutorError, NodeFailure, Operation, PlanError};
use ridgeline_graph::GraphError;
use ridgeline_provider::{ProviderCall, ProviderError, RetryPolicy, SimulatedProvider};
use ridgeline_state::StateStore;

const KEY: DigestKey = DigestKey::from_bytes([7; DigestKey::LEN]);

fn media_env(db_password: &'static str) -> impl Fn(&str) -> Option<String> {
    move |var| match var {
        "RIDGE_DB_PASSWORD" => Some(db_password.to_string()),
        "RIDGE_APP_SECRET_KEY" => Some("s3cr3t-app".to_string()),
        _ => None,
    }
}

fn media_stack() -> Topology {
    Topology::from_toml_str(MEDIA_STACK_TOML, media_env("s3cr3t-db"), &KEY).unwrap()
}

fn setup() -> (SimulatedProvider, Executor) {
    let sim = SimulatedProvider::new();
    let store = StateStore::open_in_memory().unwrap();
    let exec = Executor::new(Arc::new(sim.clone()), store).with_retry(RetryPolicy::no_retry());
    (sim, exec)
}

fn create_position(sim: &SimulatedProvider, name: &str) -> usize {
    sim.calls()
        .iter()
        .position(|c| matches!(c, ProviderCall::Create { name: n, .. } if n == name))
        .unwrap_or_else(|| panic!("no create call for {name}"))
}

#[tokio::test]
async fn media_stack_apply_and_destroy() {
    let (sim, exec) = setup();
    let desired = media_stack();

    let plan = exec.plan(&desired).unwrap();
    assert_eq!(plan.summary().create, 10);
    let report = exec.apply(plan, &desired).await.unwrap();
    assert!(report.is_success(), "{report}");
    assert_eq!(report.outcomes().len(), 10);

    // Eight provider resources; the two secrets live in the secret store.
    assert_eq!(sim.live_count(), 8);

    // The service is created after everything it references.
    let app = create_position(&sim, "app");
    for producer in ["vpc", "lb", "database", "cache", "media_bucket"] {
        assert!(create_position(&sim, producer) < app, "{producer} after app");
    }

    let store = exec.store();
    let database = store.get_resource("database").unwrap().unwrap();
    let app = store.get_resource("app").unwrap().unwrap();
    let env = app.applied["environment"].as_map().unwrap();
    assert_eq!(env["POSTGRES_HOST"], database.outputs["endpoint"]);
    assert_eq!(database.lifecycle, LifecycleState::Active);

    // Consumers can read their secrets; plaintext never reaches state.
    let db_password = store.get_resource("db_password").unwrap().unwrap();
    let handle = db_password.outputs["handle"].as_str().unwrap();
    assert_eq!(
        sim.resolve_secret(handle, "mediacms-task-execution").unwrap().expose(),
        "s3cr3t-db"
    );
    assert_eq!(sim.resolve_secret(handle, "mediacms-db").unwrap().expose(), "s3cr3t-db");
    for record in store.list_resources().unwrap() {
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("s3cr3t"), "{} leaked a secret", record.id);
    }

    // Control loops have somewhere to resume from.
    let scaling = store.get_scaling_policy("app").unwrap().unwrap();
    assert_eq!(scaling.current_capacity, 2);
    assert_eq!(store.list_alarms().unwrap().len(), 2);
    let alarm = store.get_alarm("app_cpu_high").unwrap().unwrap();
    assert_eq!(alarm.state, AlarmState::InsufficientData);

    assert!(exec.plan(&desired).unwrap().is_noop());

    let report = exec.destroy_all().await.unwrap();
    assert!(report.is_success(), "{report}");
    assert_eq!(sim.live_count(), 0);
    assert!(store.list_resources().unwrap().is_empty());
    assert!(store.list_secrets().unwrap().is_empty());
    assert!(store.list_alarms().unwrap().is_empty());
    assert!(store.list_scaling_policies().unwrap().is_empty());
}

const PARTIAL: &str = r#"
[[resource]]
id = "net"
kind = "network"
[resource.config]
cidr_block = "10.0.0.0/16"

[[resource]]
id = "db"
kind = "relational_store"
[resource.config]
engine = "postgres"
subnet_ids = { ref = "net.private_subnet_ids" }

[[resource]]
id = "app"
kind = "compute_service"
[resource.config]
image = "app:1"
subnets = { ref = "net.private_subnet_ids" }
[resource.config.environment]
DB = { ref = "db.endpoint" }

[[resource]]
id = "lb"
kind = "load_balancer"
[resource.config]
scheme = "internet-facing"
subnets = { ref = "net.public_subnet_ids" }
"#;

#[tokio::test]
async fn failure_skips_dependents_and_spares_independent_branches() {
    let (sim, exec) = setup();
    sim.fail_create_for("db", ProviderError::Rejected("quota exceeded".to_string()));
    let desired = Topology::from_toml_str(PARTIAL, |_| None, &KEY).unwrap();

    let report = exec.apply(exec.plan(&desired).unwrap(), &desired).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(report.state_of("net"), Some(LifecycleState::Active));
    assert_eq!(report.state_of("lb"), Some(LifecycleState::Active));
    assert_eq!(report.state_of("db"), Some(LifecycleState::Failed));
    assert!(matches!(
        report.failure_of("db"),
        Some(NodeFailure::Provider(ProviderError::Rejected(_)))
    ));
    assert_eq!(report.state_of("app"), Some(LifecycleState::Pending));
    assert_eq!(
        report.failure_of("app"),
        Some(&NodeFailure::DependencyFailed {
            upstream: "db".to_string()
        })
    );
    assert!(
        !sim.calls()
            .iter()
            .any(|c| matches!(c, ProviderCall::Create { name, .. } if name == "app"))
    );

    let store = exec.store();
    assert_eq!(
        store.get_resource("db").unwrap().unwrap().lifecycle,
        LifecycleState::Failed
    );
    assert_eq!(
        store.get_resource("app").unwrap().unwrap().lifecycle,
        LifecycleState::Pending
    );

    // Re-planning resumes where the apply stopped.
    sim.clear_faults();
    let plan = exec.plan(&desired).unwrap();
    assert_eq!(plan.operation_of("net"), Some(Operation::NoOp));
    assert_eq!(plan.operation_of("lb"), Some(Operation::NoOp));
    let db = plan.get("db").unwrap();
    assert_eq!(db.operation, Operation::Create);
    assert_eq!(db.reason, "previous apply failed before creation");
    assert_eq!(plan.operation_of("app"), Some(Operation::Create));

    let report = exec.apply(plan, &desired).await.unwrap();
    assert!(report.is_success(), "{report}");
    assert_eq!(sim.live_count(), 4);
}

#[tokio::test]
async fn cycle_is_rejected_before_any_provider_call() {
    let (sim, exec) = setup();
    let desired = Topology::from_toml_str(
        r#"
[[resource]]
id = "a"
kind = "object_store"
[resource.config]
peer = { ref = "b.arn" }

[[resource]]
id = "b"
kind = "object_store"
[resource.config]
peer = { ref = "a.arn" }
"#,
        |_| None,
        &KEY,
    )
    .unwrap();

    let err = exec.plan(&desired).unwrap_err();
    match err {
        ExecutorError::Plan(PlanError::Graph(GraphError::CycleDetected { cycle })) => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert!(sim.calls().is_empty());
}

fn buckets(n: usize) -> Topology {
    let toml_str: String = (0..n)
        .map(|i| format!("[[resource]]\nid = \"bucket{i}\"\nkind = \"object_store\"\n\n"))
        .collect();
    Topology::from_toml_str(&toml_str, |_| None, &KEY).unwrap()
}

#[tokio::test(start_paused = true)]
async fn parallelism_bounds_in_flight_operations() {
    let (sim, exec) = setup();
    let exec = exec.with_parallelism(2);
    sim.set_latency(Duration::from_millis(50));
    let desired = buckets(8);

    let report = exec.apply(exec.plan(&desired).unwrap(), &desired).await.unwrap();
    assert!(report.is_success(), "{report}");
    assert_eq!(sim.live_count(), 8);
    assert_eq!(sim.peak_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let sim = SimulatedProvider::new();
    let store = StateStore::open_in_memory().unwrap();
    let exec = Executor::new(Arc::new(sim.clone()), store);
    sim.fail_next(2);
    let desired = buckets(1);

    let report = exec.apply(exec.plan(&desired).unwrap(), &desired).await.unwrap();
    assert!(report.is_success(), "{report}");
    let creates = sim
        .calls()
        .iter()
        .filter(|c| matches!(c, ProviderCall::Create { .. }))
        .count();
    assert_eq!(creates, 3);
}

#[tokio::test]
async fn cancelled_apply_starts_nothing() {
    let (sim, exec) = setup();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let exec = exec.with_cancellation(cancel_rx);
    cancel_tx.send(true).unwrap();
    let desired = Topology::from_toml_str(PARTIAL, |_| None, &KEY).unwrap();

    let report = exec.apply(exec.plan(&desired).unwrap(), &desired).await.unwrap();
    assert_eq!(report.skipped().count(), 4);
    assert!(report
        .outcomes()
        .iter()
        .all(|o| o.failure == Some(NodeFailure::Cancelled)));
    assert!(sim.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_lets_running_nodes_finish() {
    let (sim, exec) = setup();
    sim.set_latency(Duration::from_millis(100));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let exec = exec.with_cancellation(cancel_rx);
    let desired = Topology::from_toml_str(PARTIAL, |_| None, &KEY).unwrap();
    let plan = exec.plan(&desired).unwrap();

    let apply = tokio::spawn(async move { exec.apply(plan, &desired).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel_tx.send(true).unwrap();

    let report = apply.await.unwrap().unwrap();
    assert_eq!(report.state_of("net"), Some(LifecycleState::Active));
    for id in ["db", "app", "lb"] {
        assert_eq!(report.failure_of(id), Some(&NodeFailure::Cancelled), "{id}");
    }
    assert_eq!(sim.live_count(), 1);
}

#[tokio::test]
async fn secret_rotation_does_not_touch_consumers() {
    let (sim, exec) = setup();
    let desired = media_stack();
    exec.apply(exec.plan(&desired).unwrap(), &desired).await.unwrap();
    let before = sim.calls().len();

    let rotated = Topology::from_toml_str(MEDIA_STACK_TOML, media_env("n3w-s3cr3t-db"), &KEY).unwrap();
    let plan = exec.plan(&rotated).unwrap();
    assert_eq!(plan.operation_of("db_password"), Some(Operation::Update));
    assert_eq!(plan.summary().update, 1);

    let report = exec.apply(plan, &rotated).await.unwrap();
    assert!(report.is_success(), "{report}");

    let calls = &sim.calls()[before..];
    assert_eq!(calls.len(), 1, "{calls:?}");
    assert!(matches!(&calls[0], ProviderCall::PutSecret { name } if name == "mediacms/db-password"));

    let handle = exec.store().get_resource("db_password").unwrap().unwrap().outputs["handle"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(sim.secret_version(&handle), Some(2));
    assert_eq!(
        sim.resolve_secret(&handle, "mediacms-task-execution").unwrap().expose(),
        "n3w-s3cr3t-db"
    );
    assert!(exec.plan(&rotated).unwrap().is_noop());
}

#[tokio::test]
async fn changed_outputs_propagate_to_consumers() {
    let (sim, exec) = setup();
    let desired = media_stack();
    exec.apply(exec.plan(&desired).unwrap(), &desired).await.unwrap();
    let old_db = sim.handle_for("database").unwrap();
    let old_alarm = sim.handle_for("db_cpu_high").unwrap();
    let before = sim.mutations().len();

    let changed = Topology::from_toml_str(
        &MEDIA_STACK_TOML
            .replace("engine = \"postgres\"", "engine = \"mysql\"")
            .replace("port = 5432", "port = 3306"),
        media_env("s3cr3t-db"),
        &KEY,
    )
    .unwrap();
    let plan = exec.plan(&changed).unwrap();
    assert!(plan.get("database").unwrap().requires_replace());
    assert_eq!(plan.operation_of("app"), Some(Operation::NoOp));
    assert_eq!(plan.operation_of("db_cpu_high"), Some(Operation::NoOp));

    let report = exec.apply(plan, &changed).await.unwrap();
    assert!(report.is_success(), "{report}");

    // New endpoint reaches the service, new handle reaches the alarm.
    let new_db = sim.handle_for("database").unwrap();
    assert_ne!(old_db, new_db);
    assert!(!sim.contains(&old_db));
    assert_eq!(report.outcome("app").unwrap().operation, Operation::Update);
    assert_eq!(report.outcome("db_cpu_high").unwrap().operation, Operation::Update);
    assert_eq!(report.outcome("app_cpu_high").unwrap().operation, Operation::NoOp);

    // The alarm's target cannot change in place, so it goes before the
    // database it watches; the service is updated in place.
    let destroys: Vec<String> = sim.mutations()[before..]
        .iter()
        .filter_map(|call| match call {
            ProviderCall::Destroy { handle } => Some(handle.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(destroys, vec![old_alarm.to_string(), old_db.to_string()]);
    assert!(!sim.contains(&old_alarm));

    let store = exec.store();
    let app = store.get_resource("app").unwrap().unwrap();
    assert_eq!(
        app.applied["environment"].as_map().unwrap()["POSTGRES_HOST"],
        Value::from("database.db.sim.internal:3306")
    );
    let alarm = store.get_resource("db_cpu_high").unwrap().unwrap();
    assert_eq!(alarm.applied["target"], Value::from(new_db.as_str()));
    assert!(exec.plan(&changed).unwrap().is_noop());
}

#[tokio::test]
async fn missing_resource_is_recreated_after_refresh() {
    let (sim, exec) = setup();
    let desired = buckets(2);
    exec.apply(exec.plan(&desired).unwrap(), &desired).await.unwrap();

    // Deleted out of band.
    use ridgeline_provider::Provider;
    let handle = sim.handle_for("bucket1").unwrap();
    sim.destroy(&handle).await.unwrap();

    let (plan, drift) = exec.plan_with_drift(&desired).await.unwrap();
    assert!(drift.get("bucket1").unwrap().missing);
    assert_eq!(plan.operation_of("bucket0"), Some(Operation::NoOp));
    assert_eq!(plan.operation_of("bucket1"), Some(Operation::Create));

    let report = exec.apply(plan, &desired).await.unwrap();
    assert!(report.is_success(), "{report}");
    assert_eq!(sim.live_count(), 2);
}
