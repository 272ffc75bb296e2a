//! `ridge state` — read-only views of the state store.
//!
//! Secret values never reach the store, so nothing printed here can leak
//! one. Secret records show name, handle, version and readers only.

use anyhow::bail;

use super::{Options, Workspace};

pub fn list(opts: &Options) -> anyhow::Result<()> {
    let ws = Workspace::open(&opts.data_dir)?;

    let resources = ws.store.list_resources()?;
    println!("Resources ({}):", resources.len());
    for r in &resources {
        println!(
            "  {:<20} {:<18} {:<10} {}",
            r.id,
            r.kind.as_str(),
            r.lifecycle.to_string(),
            r.handle.as_deref().unwrap_or("-")
        );
    }

    let secrets = ws.store.list_secrets()?;
    if !secrets.is_empty() {
        println!("Secrets ({}):", secrets.len());
        for s in &secrets {
            let readers: Vec<&str> = s.access_policy.iter().map(String::as_str).collect();
            println!(
                "  {:<28} {} v{}  readers: {}",
                s.name,
                s.handle,
                s.version,
                readers.join(", ")
            );
        }
    }

    let policies = ws.store.list_scaling_policies()?;
    if !policies.is_empty() {
        println!("Scaling ({}):", policies.len());
        for p in &policies {
            println!(
                "  {:<20} capacity {} ({}..={}) on {} @ {}",
                p.target,
                p.current_capacity,
                p.policy.min_capacity,
                p.policy.max_capacity,
                p.policy.metric_name,
                p.policy.target_metric_value
            );
        }
    }

    let alarms = ws.store.list_alarms()?;
    if !alarms.is_empty() {
        println!("Alarms ({}):", alarms.len());
        for a in &alarms {
            println!(
                "  {:<20} {:<18} {} {} {} for {} periods",
                a.spec.alarm_id,
                a.state.to_string(),
                a.spec.metric_name,
                a.spec.comparison,
                a.spec.threshold,
                a.spec.evaluation_periods
            );
        }
    }
    Ok(())
}

/// Print every record held for `id` as JSON.
pub fn show(opts: &Options, id: &str) -> anyhow::Result<()> {
    let ws = Workspace::open(&opts.data_dir)?;
    let resource = ws.store.get_resource(id)?;
    let scaling = ws.store.get_scaling_policy(id)?;
    let alarm = ws.store.get_alarm(id)?;
    if resource.is_none() && scaling.is_none() && alarm.is_none() {
        bail!("no state recorded for {id}");
    }

    let out = serde_json::json!({
        "resource": resource,
        "scaling": scaling,
        "alarm": alarm,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
