use anyhow::bail;
use tokio::sync::watch;
use tracing::{info, warn};

use ridgeline_executor::{ApplyReport, DriftReport, Operation, Plan};

use super::{Options, Workspace};

pub async fn plan(opts: &Options, refresh: bool, format: &str) -> anyhow::Result<()> {
    let ws = Workspace::open(&opts.data_dir)?;
    let topology = opts.load_topology(&ws)?;
    let executor = ws.executor(&topology.engine, opts.parallelism);

    let (plan, drift) = if refresh {
        executor.plan_with_drift(&topology).await?
    } else {
        (executor.plan(&topology)?, DriftReport::default())
    };

    match format {
        "json" => {
            let out = serde_json::json!({ "plan": plan, "drift": drift });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        _ => {
            print_drift(&drift);
            print_plan(&plan);
        }
    }
    Ok(())
}

pub async fn apply(opts: &Options, refresh: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(&opts.data_dir)?;
    let topology = opts.load_topology(&ws)?;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let executor = ws
        .executor(&topology.engine, opts.parallelism)
        .with_cancellation(cancel_rx);

    let plan = if refresh {
        let (plan, drift) = executor.plan_with_drift(&topology).await?;
        print_drift(&drift);
        plan
    } else {
        executor.plan(&topology)?
    };
    print_plan(&plan);
    if plan.is_noop() {
        return Ok(());
    }

    let interrupt = watch_interrupt(cancel_tx);
    let report = executor.apply(plan, &topology).await;
    interrupt.abort();
    // Provider-side changes are real even when some nodes failed.
    ws.save()?;

    finish(report?)
}

pub async fn destroy(opts: &Options) -> anyhow::Result<()> {
    let ws = Workspace::open(&opts.data_dir)?;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let engine = opts.engine_settings();
    let executor = ws
        .executor(&engine, opts.parallelism)
        .with_cancellation(cancel_rx);

    let interrupt = watch_interrupt(cancel_tx);
    let report = executor.destroy_all().await;
    interrupt.abort();
    ws.save()?;

    finish(report?)
}

/// Ctrl-C stops new nodes from starting; in-flight ones finish.
fn watch_interrupt(cancel_tx: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, waiting for in-flight operations");
            let _ = cancel_tx.send(true);
        }
    })
}

fn finish(report: ApplyReport) -> anyhow::Result<()> {
    print_report(&report);
    info!(%report, "apply finished");
    if !report.is_success() {
        bail!("apply incomplete: {report}");
    }
    Ok(())
}

fn print_plan(plan: &Plan) {
    for entry in plan.entries() {
        let symbol = match entry.operation {
            Operation::Create => "+",
            Operation::Update if entry.requires_replace() => "-/+",
            Operation::Update => "~",
            Operation::Destroy => "-",
            Operation::NoOp => continue,
        };
        println!("{symbol:>3} {} ({}): {}", entry.resource_id, entry.kind, entry.reason);
        for change in &entry.changes {
            let show = |v: &Option<ridge_core::Value>| v.as_ref().map_or("(none)".to_string(), |v| v.to_string());
            let replace = if change.requires_replace {
                " (forces replacement)"
            } else {
                ""
            };
            println!(
                "      {}: {} -> {}{replace}",
                change.field,
                show(&change.before),
                show(&change.after)
            );
        }
    }
    if plan.is_noop() {
        println!("No changes. {}", plan.summary());
    } else {
        println!("Plan: {}", plan.summary());
    }
}

fn print_drift(drift: &DriftReport) {
    for d in drift.drifted() {
        if d.missing {
            println!("! {} no longer exists at the provider", d.resource_id);
            continue;
        }
        let fields: Vec<&str> = d.fields.iter().map(|f| f.field.as_str()).collect();
        println!("! {} drifted: {}", d.resource_id, fields.join(", "));
    }
}

fn print_report(report: &ApplyReport) {
    for outcome in report.outcomes() {
        match &outcome.failure {
            None => println!("  ✓ {} {} → {}", outcome.operation, outcome.resource_id, outcome.state),
            Some(failure) if outcome.skipped() => {
                println!("  · {} {} skipped: {failure}", outcome.operation, outcome.resource_id)
            }
            Some(failure) => println!("  ✗ {} {} failed: {failure}", outcome.operation, outcome.resource_id),
        }
    }
    println!("{report}");
}
