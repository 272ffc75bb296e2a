//! Alarm monitor — background task per alarm.
//!
//! The `AlarmMonitor` resolves each alarm's target reference to a provider
//! handle, subscribes to the metric and runs the samples through an
//! [`AlarmTracker`]. State and counters are persisted after every sample
//! so a restarted monitor resumes where it stopped.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ridge_core::{AttributeRef, Value};
use ridgeline_provider::{Provider, ResourceHandle, RetryPolicy};
use ridgeline_state::{AlarmRecord, StateStore};

use crate::error::{AlarmError, AlarmResult};
use crate::tracker::{AlarmTracker, Transition};

/// Per-alarm monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages one monitor task per alarm.
pub struct AlarmMonitor {
    provider: Arc<dyn Provider>,
    store: StateStore,
    retry: RetryPolicy,
    /// Active monitors: alarm id → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl AlarmMonitor {
    pub fn new(provider: Arc<dyn Provider>, store: StateStore) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Start a monitor for every alarm recorded in state. Alarms whose
    /// target cannot be resolved are logged and skipped.
    pub async fn start_all(&self) -> AlarmResult<usize> {
        let mut started = 0;
        for record in self.store.list_alarms()? {
            let id = record.spec.alarm_id.clone();
            match self.start_record(record).await {
                Ok(()) => started += 1,
                Err(e) => warn!(alarm = %id, error = %e, "alarm not monitored"),
            }
        }
        info!(alarms = started, "alarm monitors started");
        Ok(started)
    }

    /// Start (or restart) monitoring one alarm.
    pub async fn start_monitor(&self, alarm_id: &str) -> AlarmResult<()> {
        let record = self
            .store
            .get_alarm(alarm_id)?
            .ok_or_else(|| AlarmError::UnknownAlarm(alarm_id.to_string()))?;
        self.start_record(record).await
    }

    async fn start_record(&self, record: AlarmRecord) -> AlarmResult<()> {
        let alarm_id = record.spec.alarm_id.clone();
        let target = resolve_target(&self.store, &alarm_id, &record.spec.target)?;
        let samples = self
            .provider
            .stream_metric(&target, &record.spec.metric_name, record.spec.period)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = LoopContext {
            provider: self.provider.clone(),
            store: self.store.clone(),
            retry: self.retry,
        };
        let tracker = AlarmTracker::from_record(record);
        let handle = tokio::spawn(async move {
            ctx.run(tracker, samples, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            alarm_id.clone(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(alarm = %alarm_id, %target, "alarm monitor started");
        Ok(())
    }

    pub async fn stop_monitor(&self, alarm_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(alarm_id) {
            let _ = slot.shutdown_tx.send(true);
            let _ = slot.handle.await;
            info!(alarm = %alarm_id, "alarm monitor stopped");
        }
    }

    /// Stop every monitor and wait for it to finish.
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            let _ = slot.handle.await;
            debug!(alarm = %id, "alarm monitor stopped");
        }
        info!("all alarm monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, alarm_id: &str) -> bool {
        self.monitors.read().await.contains_key(alarm_id)
    }
}

/// Look up the handle an alarm's target reference points at.
fn resolve_target(store: &StateStore, alarm_id: &str, target: &AttributeRef) -> AlarmResult<ResourceHandle> {
    store
        .get_resource(&target.resource)?
        .and_then(|record| target.lookup(&record.outputs))
        .as_ref()
        .and_then(Value::as_str)
        .map(ResourceHandle::from)
        .ok_or_else(|| AlarmError::UnresolvedTarget {
            alarm: alarm_id.to_string(),
            target: target.to_string(),
        })
}

/// What a monitor task needs from its owner.
struct LoopContext {
    provider: Arc<dyn Provider>,
    store: StateStore,
    retry: RetryPolicy,
}

impl LoopContext {
    async fn run(
        &self,
        mut tracker: AlarmTracker,
        mut samples: ridgeline_provider::MetricStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let alarm_id = tracker.spec().alarm_id.clone();
        let staleness = tracker.spec().staleness;
        debug!(alarm = %alarm_id, state = %tracker.state(), "alarm loop starting");

        loop {
            let transition = tokio::select! {
                next = tokio::time::timeout(staleness, samples.next()) => match next {
                    Ok(Some(sample)) => tracker.record(sample),
                    Ok(None) => {
                        info!(alarm = %alarm_id, "metric stream closed");
                        break;
                    }
                    Err(_) => {
                        warn!(alarm = %alarm_id, silent_secs = staleness.as_secs(), "metric stream stale");
                        tracker.mark_stale()
                    }
                },
                _ = shutdown.changed() => {
                    debug!(alarm = %alarm_id, "alarm loop shutting down");
                    break;
                }
            };

            // The stored spec belongs to the executor; only evaluation state
            // is written back.
            match self.store.modify_alarm(&alarm_id, |record| tracker.write_state(record)) {
                Ok(true) => {}
                Ok(false) => debug!(alarm = %alarm_id, "alarm record gone; state not persisted"),
                Err(e) => error!(alarm = %alarm_id, error = %e, "failed to persist alarm state"),
            }
            if let Some(transition) = transition {
                info!(alarm = %alarm_id, %transition, "alarm state changed");
                self.dispatch(&tracker, transition).await;
            }
        }
    }

    /// Notify every action registered for the state just entered.
    async fn dispatch(&self, tracker: &AlarmTracker, transition: Transition) {
        let spec = tracker.spec();
        let message = format!(
            "{}: {} ({} {} {})",
            spec.alarm_id, transition, spec.metric_name, spec.comparison, spec.threshold
        );
        for action in spec.actions_for(transition.to) {
            if let Err(e) = self
                .retry
                .run("notify", || self.provider.notify(action, &message))
                .await
            {
                error!(alarm = %spec.alarm_id, %action, error = %e, "notification failed");
            }
        }
    }
}
