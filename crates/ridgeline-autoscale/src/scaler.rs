//! Autoscaler — one control loop per scaling target.
//!
//! Targets are loaded from the state store's `scaling_policies` table,
//! which the executor fills when it creates a compute service with a
//! `scaling` table. Each loop subscribes to the target's metric stream,
//! feeds samples through [`ScalingTarget::apply_sample`], pushes the new
//! `desired_count` to the provider and persists capacity and last action.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use ridge_core::{EngineConfig, Value};
use ridgeline_provider::{ConfigDelta, MetricSample, Provider, ResourceHandle, RetryPolicy};
use ridgeline_state::{StateStore, unix_now};

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::target::{ScaleDecision, ScalingTarget};

/// Interval requested from the provider's metric stream.
const SAMPLE_PERIOD: Duration = Duration::from_secs(60);

/// Drives every scaling target recorded in the state store.
pub struct Autoscaler {
    provider: Arc<dyn Provider>,
    store: StateStore,
    retry: RetryPolicy,
    staleness: Duration,
}

impl Autoscaler {
    pub fn new(provider: Arc<dyn Provider>, store: StateStore) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
            staleness: Duration::from_secs(180),
        }
    }

    /// Take retry and staleness settings from the `[engine]` table.
    pub fn from_config(
        provider: Arc<dyn Provider>,
        store: StateStore,
        config: &EngineConfig,
    ) -> AutoscaleResult<Self> {
        Ok(Self::new(provider, store)
            .with_retry(RetryPolicy::from_config(&config.retry))
            .with_staleness(config.metric_staleness()?))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long a metric stream may stay silent before it counts as a gap.
    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Load one target per persisted scaling policy.
    ///
    /// Policies whose service has no provider handle (not yet created, or
    /// lost to drift) are skipped.
    pub fn load_targets(&self) -> AutoscaleResult<Vec<Arc<ScalingTarget>>> {
        let mut targets = Vec::new();
        for record in self.store.list_scaling_policies()? {
            let handle = self
                .store
                .get_resource(&record.target)?
                .and_then(|r| r.handle);
            match handle {
                Some(handle) => {
                    targets.push(Arc::new(ScalingTarget::from_record(
                        &record,
                        ResourceHandle(handle),
                    )));
                }
                None => warn!(service = %record.target, "scaling target has no handle, skipping"),
            }
        }
        Ok(targets)
    }

    /// Run one loop per target until `shutdown` fires or every metric
    /// stream ends.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> AutoscaleResult<()> {
        let targets = self.load_targets()?;
        info!(targets = targets.len(), "autoscaler started");

        let mut loops = JoinSet::new();
        for target in targets {
            let scaler = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move {
                let id = target.id().to_string();
                if let Err(e) = scaler.run_target(target, shutdown).await {
                    error!(service = %id, error = %e, "scaling loop failed");
                }
            });
        }
        while loops.join_next().await.is_some() {}

        info!("autoscaler stopped");
        Ok(())
    }

    /// Control loop for one target.
    pub async fn run_target(
        &self,
        target: Arc<ScalingTarget>,
        mut shutdown: watch::Receiver<bool>,
    ) -> AutoscaleResult<()> {
        let mut samples = self.provider.stream_metric(
            target.handle(),
            &target.policy().metric_name,
            SAMPLE_PERIOD,
        )?;
        debug!(service = %target.id(), metric = %target.policy().metric_name, "scaling loop started");

        loop {
            tokio::select! {
                next = tokio::time::timeout(self.staleness, samples.next()) => match next {
                    Ok(Some(sample)) => {
                        // A failed scale is retried by the next sample.
                        if let Err(e) = self.apply_sample(&target, sample).await {
                            warn!(service = %target.id(), error = %e, "scaling action failed");
                        }
                    }
                    Ok(None) => {
                        info!(service = %target.id(), "metric stream closed");
                        break;
                    }
                    Err(_) => {
                        warn!(
                            service = %target.id(),
                            silent_secs = self.staleness.as_secs(),
                            "metric gap, holding capacity"
                        );
                    }
                },
                _ = shutdown.changed() => {
                    debug!(service = %target.id(), "scaling loop shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Evaluate one sample for `target`, scale the service through the
    /// provider if needed and persist the outcome.
    pub async fn apply_sample(
        &self,
        target: &ScalingTarget,
        sample: MetricSample,
    ) -> AutoscaleResult<ScaleDecision> {
        let decision = target
            .apply_sample(sample, |capacity| self.scale(target.handle(), capacity))
            .await?;
        if decision != ScaleDecision::NoChange {
            self.persist(target).await?;
        }
        Ok(decision)
    }

    async fn scale(&self, handle: &ResourceHandle, capacity: u32) -> AutoscaleResult<()> {
        let mut delta = ConfigDelta::default();
        delta
            .set
            .insert("desired_count".to_string(), Value::Int(i64::from(capacity)));
        self.retry
            .run("scale", || self.provider.update(handle, &delta))
            .await?;
        Ok(())
    }

    async fn persist(&self, target: &ScalingTarget) -> AutoscaleResult<()> {
        let state = target.snapshot().await;
        let mut record = self
            .store
            .get_scaling_policy(target.id())?
            .ok_or_else(|| AutoscaleError::UnknownTarget(target.id().to_string()))?;
        record.current_capacity = state.current_capacity;
        record.last_scale_action_ms = state.last_scale_action_ms;
        record.updated_at = unix_now();
        self.store.put_scaling_policy(&record)?;
        Ok(())
    }
}
