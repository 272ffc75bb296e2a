//! Per-target scaling state and the scaling decision.

use std::cmp::Ordering;
use std::future::Future;

use tokio::sync::Mutex;
use tracing::{debug, info};

use ridge_core::{ResourceId, ScalingPolicy};
use ridgeline_provider::{MetricSample, ResourceHandle};
use ridgeline_state::ScalingPolicyRecord;

/// A scaling decision for a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Set desired capacity to this count.
    ScaleTo(u32),
    NoChange,
}

/// Mutable state of one target, guarded by its mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingState {
    pub current_capacity: u32,
    /// Sample timestamp (ms) of the last scaling action.
    pub last_scale_action_ms: Option<u64>,
}

/// Decide what to do with one observation.
///
/// A target that has never scaled has no cooldown to wait out.
pub fn evaluate(policy: &ScalingPolicy, state: &ScalingState, observed: f64, now_ms: u64) -> ScaleDecision {
    if !observed.is_finite() || observed < 0.0 || policy.target_metric_value <= 0.0 {
        return ScaleDecision::NoChange;
    }

    let current = state.current_capacity;
    let raw = (f64::from(current) * observed / policy.target_metric_value).round();
    let desired = policy.clamp(raw.min(f64::from(u32::MAX)) as u32);

    let cooldown = match desired.cmp(&current) {
        Ordering::Greater => policy.scale_out_cooldown,
        Ordering::Less => policy.scale_in_cooldown,
        Ordering::Equal => return ScaleDecision::NoChange,
    };
    if let Some(last) = state.last_scale_action_ms {
        let elapsed = now_ms.saturating_sub(last);
        if u128::from(elapsed) < cooldown.as_millis() {
            debug!(current, desired, elapsed_ms = elapsed, "within cooldown");
            return ScaleDecision::NoChange;
        }
    }
    ScaleDecision::ScaleTo(desired)
}

/// One compute service under autoscaling control.
pub struct ScalingTarget {
    id: ResourceId,
    handle: ResourceHandle,
    policy: ScalingPolicy,
    state: Mutex<ScalingState>,
}

impl ScalingTarget {
    /// `current_capacity` is clamped into the policy bounds.
    pub fn new(
        id: impl Into<ResourceId>,
        handle: ResourceHandle,
        policy: ScalingPolicy,
        current_capacity: u32,
        last_scale_action_ms: Option<u64>,
    ) -> Self {
        let state = ScalingState {
            current_capacity: policy.clamp(current_capacity),
            last_scale_action_ms,
        };
        Self {
            id: id.into(),
            handle,
            policy,
            state: Mutex::new(state),
        }
    }

    /// Resume from a persisted record.
    pub fn from_record(record: &ScalingPolicyRecord, handle: ResourceHandle) -> Self {
        Self::new(
            record.target.clone(),
            handle,
            record.policy.clone(),
            record.current_capacity,
            record.last_scale_action_ms,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub async fn snapshot(&self) -> ScalingState {
        *self.state.lock().await
    }

    /// Evaluate `sample` and, on a scaling decision, run `scale` with the
    /// new capacity.
    ///
    /// The target's lock is held across the decision and `scale`, so at
    /// most one mutation per target is ever in flight. State only advances
    /// when `scale` succeeds.
    pub async fn apply_sample<F, Fut, E>(&self, sample: MetricSample, scale: F) -> Result<ScaleDecision, E>
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut state = self.state.lock().await;
        let decision = evaluate(&self.policy, &state, sample.value, sample.timestamp_ms);
        if let ScaleDecision::ScaleTo(capacity) = decision {
            scale(capacity).await?;
            info!(
                service = %self.id,
                from = state.current_capacity,
                to = capacity,
                observed = sample.value,
                goal = self.policy.target_metric_value,
                "scaled"
            );
            state.current_capacity = capacity;
            state.last_scale_action_ms = Some(sample.timestamp_ms);
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    const SECOND: u64 = 1_000;

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            metric_name: "cpu_utilization".to_string(),
            target_metric_value: 70.0,
            min_capacity: 2,
            max_capacity: 10,
            scale_out_cooldown: Duration::from_secs(60),
            scale_in_cooldown: Duration::from_secs(300),
        }
    }

    fn state(current_capacity: u32, last: Option<u64>) -> ScalingState {
        ScalingState {
            current_capacity,
            last_scale_action_ms: last,
        }
    }

    #[test]
    fn high_load_scales_out_by_ratio() {
        assert_eq!(evaluate(&policy(), &state(2, None), 90.0, 0), ScaleDecision::ScaleTo(3));
    }

    #[test]
    fn desired_is_clamped_to_bounds() {
        assert_eq!(evaluate(&policy(), &state(8, None), 700.0, 0), ScaleDecision::ScaleTo(10));
        assert_eq!(evaluate(&policy(), &state(4, None), 1.0, 0), ScaleDecision::ScaleTo(2));
        assert_eq!(evaluate(&policy(), &state(2, None), 0.0, 0), ScaleDecision::NoChange);
    }

    #[test]
    fn on_target_is_no_change() {
        assert_eq!(evaluate(&policy(), &state(4, None), 72.0, 0), ScaleDecision::NoChange);
    }

    #[test]
    fn cooldowns_are_per_direction() {
        let last = Some(1_000 * SECOND);
        // Scale-out waits 60s.
        assert_eq!(
            evaluate(&policy(), &state(3, last), 90.0, 1_059 * SECOND),
            ScaleDecision::NoChange
        );
        assert_eq!(
            evaluate(&policy(), &state(3, last), 90.0, 1_060 * SECOND),
            ScaleDecision::ScaleTo(4)
        );
        // Scale-in waits 300s.
        assert_eq!(
            evaluate(&policy(), &state(6, last), 35.0, 1_200 * SECOND),
            ScaleDecision::NoChange
        );
        assert_eq!(
            evaluate(&policy(), &state(6, last), 35.0, 1_300 * SECOND),
            ScaleDecision::ScaleTo(3)
        );
    }

    #[test]
    fn bad_samples_are_ignored() {
        assert_eq!(evaluate(&policy(), &state(2, None), f64::NAN, 0), ScaleDecision::NoChange);
        assert_eq!(evaluate(&policy(), &state(2, None), -5.0, 0), ScaleDecision::NoChange);
    }

    #[tokio::test]
    async fn sustained_load_scales_once_within_cooldown() {
        let target = ScalingTarget::new("app", ResourceHandle::from("compute-0001"), policy(), 2, None);
        let calls = AtomicUsize::new(0);

        for i in 0..6 {
            target
                .apply_sample(MetricSample::new(i * 10 * SECOND, 90.0), |_| async {
                    calls.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok::<_, Infallible>(())
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(target.snapshot().await, state(3, Some(0)));
    }

    #[tokio::test]
    async fn failed_scale_leaves_state_untouched() {
        let target = ScalingTarget::new("app", ResourceHandle::from("compute-0001"), policy(), 2, None);
        let result = target
            .apply_sample(MetricSample::new(0, 90.0), |_| async { Err("throttled") })
            .await;
        assert_eq!(result, Err("throttled"));
        assert_eq!(target.snapshot().await, state(2, None));
    }

    #[tokio::test]
    async fn one_mutation_in_flight_per_target() {
        let target = Arc::new(ScalingTarget::new(
            "app",
            ResourceHandle::from("compute-0001"),
            policy(),
            2,
            None,
        ));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..4u64 {
            let target = target.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                // Samples far enough apart that every one may scale.
                let sample = MetricSample::new(i * 600 * SECOND, 200.0);
                target
                    .apply_sample(sample, |_| async {
                        let now = in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        peak.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::task::yield_now().await;
                        in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok::<_, Infallible>(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 1);
    }
}
