//! Alarm evaluation state machine.

use std::fmt;

use tracing::{debug, warn};

use ridge_core::{AlarmSpec, AlarmState};
use ridgeline_provider::MetricSample;
use ridgeline_state::{AlarmRecord, unix_now};

/// A change of alarm state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AlarmState,
    pub to: AlarmState,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Tracks consecutive samples for a single alarm.
#[derive(Debug, Clone)]
pub struct AlarmTracker {
    spec: AlarmSpec,
    state: AlarmState,
    consecutive_breaches: u32,
    consecutive_oks: u32,
    last_sample_ms: Option<u64>,
    samples_since_reset: u32,
}

impl AlarmTracker {
    pub fn new(spec: AlarmSpec) -> Self {
        Self {
            spec,
            state: AlarmState::InsufficientData,
            consecutive_breaches: 0,
            consecutive_oks: 0,
            last_sample_ms: None,
            samples_since_reset: 0,
        }
    }

    /// Resume from persisted state.
    pub fn from_record(record: AlarmRecord) -> Self {
        Self {
            spec: record.spec,
            state: record.state,
            consecutive_breaches: record.consecutive_breaches,
            consecutive_oks: record.consecutive_oks,
            last_sample_ms: record.last_sample_ms,
            samples_since_reset: record.samples_since_reset,
        }
    }

    /// Copy evaluation state into `record`, leaving its spec untouched.
    pub fn write_state(&self, record: &mut AlarmRecord) {
        record.state = self.state;
        record.consecutive_breaches = self.consecutive_breaches;
        record.consecutive_oks = self.consecutive_oks;
        record.last_sample_ms = self.last_sample_ms;
        record.samples_since_reset = self.samples_since_reset;
        record.updated_at = unix_now();
    }

    pub fn spec(&self) -> &AlarmSpec {
        &self.spec
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn consecutive_breaches(&self) -> u32 {
        self.consecutive_breaches
    }

    /// Evaluate one sample. Returns the transition it caused, if any.
    ///
    /// A sample arriving more than the staleness window after the previous
    /// one starts a fresh run from `INSUFFICIENT_DATA`. Once a full window of
    /// `evaluation_periods` samples has arrived without a gap, the alarm
    /// leaves `INSUFFICIENT_DATA` for `OK` unless the breach run reaches
    /// `ALARM`.
    pub fn record(&mut self, sample: MetricSample) -> Option<Transition> {
        let from = self.state;

        if let Some(last) = self.last_sample_ms {
            let gap = sample.timestamp_ms.saturating_sub(last);
            if u128::from(gap) > self.spec.staleness.as_millis() {
                warn!(alarm = %self.spec.alarm_id, gap_ms = gap, "gap in metric stream");
                self.reset();
            }
        }
        self.last_sample_ms = Some(sample.timestamp_ms);
        self.samples_since_reset = self.samples_since_reset.saturating_add(1);

        let needed = self.spec.evaluation_periods;
        if self.spec.comparison.breaches(sample.value, self.spec.threshold) {
            self.consecutive_oks = 0;
            self.consecutive_breaches = self.consecutive_breaches.saturating_add(1);
            if self.consecutive_breaches >= needed {
                self.state = AlarmState::Alarm;
            }
        } else {
            self.consecutive_breaches = 0;
            self.consecutive_oks = self.consecutive_oks.saturating_add(1);
            if self.consecutive_oks >= needed {
                self.state = AlarmState::Ok;
            }
        }
        if self.state == AlarmState::InsufficientData && self.samples_since_reset >= needed {
            self.state = AlarmState::Ok;
        }

        debug!(
            alarm = %self.spec.alarm_id,
            value = sample.value,
            breaches = self.consecutive_breaches,
            oks = self.consecutive_oks,
            state = %self.state,
            "sample evaluated"
        );
        self.transition_from(from)
    }

    /// The metric stream went silent: force `INSUFFICIENT_DATA`.
    pub fn mark_stale(&mut self) -> Option<Transition> {
        let from = self.state;
        self.reset();
        self.last_sample_ms = None;
        self.transition_from(from)
    }

    fn reset(&mut self) {
        self.consecutive_breaches = 0;
        self.consecutive_oks = 0;
        self.samples_since_reset = 0;
        self.state = AlarmState::InsufficientData;
    }

    fn transition_from(&self, from: AlarmState) -> Option<Transition> {
        (from != self.state).then_some(Transition {
            from,
            to: self.state,
        })
    }
}
