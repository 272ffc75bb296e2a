use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info};

use ridgeline_alarm::AlarmMonitor;
use ridgeline_autoscale::Autoscaler;
use ridgeline_provider::{MetricSample, Provider, ResourceHandle, RetryPolicy, SimulatedProvider};
use ridgeline_state::StateStore;

use super::{Options, Workspace};

const SYNTHETIC_PERIOD: Duration = Duration::from_secs(60);

/// Run every scaling loop and alarm monitor until Ctrl-C.
pub async fn monitor(opts: &Options, synthetic_cpu: Option<f64>) -> anyhow::Result<()> {
    let engine = opts.engine_settings();
    let ws = Workspace::open(&opts.data_dir)?;
    let provider: Arc<dyn Provider> = Arc::new(ws.provider.clone());

    let autoscaler = Arc::new(Autoscaler::from_config(
        provider.clone(),
        ws.store.clone(),
        &engine,
    )?);
    let alarms =
        AlarmMonitor::new(provider, ws.store.clone()).with_retry(RetryPolicy::from_config(&engine.retry));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scaling = tokio::spawn(autoscaler.run(shutdown_rx.clone()));
    let started = alarms.start_all().await?;

    let feeder = match synthetic_cpu {
        Some(value) => {
            let series = metric_series(&ws.store)?;
            Some(tokio::spawn(synthetic_load(
                ws.provider.clone(),
                series,
                value,
                shutdown_rx,
            )))
        }
        None => None,
    };

    info!(alarms = started, "monitoring, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    alarms.stop_all().await;
    scaling.await.context("autoscaler task panicked")??;
    if let Some(feeder) = feeder {
        let _ = feeder.await;
    }

    // Scaling actions changed live desired counts.
    ws.save()?;
    info!("monitor stopped");
    Ok(())
}

/// Every `(handle, metric)` pair a scaling policy or alarm listens to.
fn metric_series(store: &StateStore) -> anyhow::Result<Vec<(ResourceHandle, String)>> {
    let mut series = Vec::new();
    for record in store.list_scaling_policies()? {
        if let Some(handle) = store.get_resource(&record.target)?.and_then(|r| r.handle) {
            series.push((ResourceHandle(handle), record.policy.metric_name));
        }
    }
    for record in store.list_alarms()? {
        if let Some(handle) = store
            .get_resource(&record.spec.target.resource)?
            .and_then(|r| r.handle)
        {
            series.push((ResourceHandle(handle), record.spec.metric_name));
        }
    }
    series.sort();
    series.dedup();
    Ok(series)
}

/// Publish a constant reading on every series once per period.
async fn synthetic_load(
    provider: SimulatedProvider,
    series: Vec<(ResourceHandle, String)>,
    value: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(SYNTHETIC_PERIOD);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default();
                for (handle, metric) in &series {
                    let delivered = provider.push_metric(handle, metric, MetricSample::new(now_ms, value));
                    debug!(%handle, metric = %metric, value, delivered, "synthetic sample published");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridge_core::{AlarmSpec, AttributeRef, Comparison, Resource, ResourceKind, ScalingPolicy};
    use ridgeline_state::{AlarmRecord, ResourceRecord, ScalingPolicyRecord};
    use std::collections::BTreeMap;

    fn live(store: &StateStore, id: &str, handle: &str) {
        let resource = Resource::new(
            id,
            ResourceKind::ComputeService,
            BTreeMap::new(),
            &Default::default(),
        )
        .unwrap();
        let mut record = ResourceRecord::pending(&resource);
        record.handle = Some(handle.to_string());
        store.put_resource(&record).unwrap();
    }

    #[test]
    fn series_cover_scaling_and_alarm_targets_once() {
        let store = StateStore::open_in_memory().unwrap();
        live(&store, "app", "compute_service-0001");
        live(&store, "worker", "compute_service-0002");

        store
            .put_scaling_policy(&ScalingPolicyRecord {
                target: "app".to_string(),
                policy: ScalingPolicy {
                    metric_name: "cpu_utilization".to_string(),
                    target_metric_value: 70.0,
                    min_capacity: 2,
                    max_capacity: 10,
                    scale_out_cooldown: Duration::from_secs(60),
                    scale_in_cooldown: Duration::from_secs(300),
                },
                current_capacity: 2,
                last_scale_action_ms: None,
                updated_at: 0,
            })
            .unwrap();
        for (alarm_id, target) in [("app_cpu_high", "app"), ("worker_cpu_high", "worker")] {
            store
                .put_alarm(&AlarmRecord::new(AlarmSpec {
                    alarm_id: alarm_id.to_string(),
                    target: AttributeRef::new(target, "handle"),
                    metric_name: "cpu_utilization".to_string(),
                    comparison: Comparison::GreaterThan,
                    threshold: 85.0,
                    evaluation_periods: 2,
                    period: Duration::from_secs(300),
                    staleness: Duration::from_secs(600),
                    alarm_actions: Vec::new(),
                    ok_actions: Vec::new(),
                    insufficient_data_actions: Vec::new(),
                }))
                .unwrap();
        }

        let series = metric_series(&store).unwrap();
        assert_eq!(
            series,
            vec![
                (ResourceHandle::from("compute_service-0001"), "cpu_utilization".to_string()),
                (ResourceHandle::from("compute_service-0002"), "cpu_utilization".to_string()),
            ]
        );
    }
}
