//! Scaling policies and alarm definitions.
//!
//! Both are declared inside resource config: a compute service carries a
//! `scaling` table, and an `alarm` resource describes the metric it watches.
//! This module turns that config into typed definitions; the runtime state
//! (capacity, last action, alarm state) lives with the control loops.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{CoreError, CoreResult};
use crate::resource::{Resource, ResourceKind};
use crate::value::{AttributeRef, Value};

// ── Scaling ───────────────────────────────────────────────────────

/// Target-tracking scaling policy for a compute service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub metric_name: String,
    pub target_metric_value: f64,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub scale_out_cooldown: Duration,
    pub scale_in_cooldown: Duration,
}

impl ScalingPolicy {
    /// Read the `scaling` table out of a resource's config.
    ///
    /// Returns `Ok(None)` when the resource declares no scaling.
    pub fn from_resource(resource: &Resource) -> CoreResult<Option<Self>> {
        let Some(scaling) = resource.config.get("scaling") else {
            return Ok(None);
        };
        let id = resource.id.as_str();
        if resource.kind != ResourceKind::ComputeService {
            return Err(CoreError::config(
                id,
                "only compute services can declare scaling",
            ));
        }
        let table = scaling
            .as_map()
            .ok_or_else(|| CoreError::config(id, "scaling must be a table"))?;

        let metric_name = optional_str(table, "metric")
            .unwrap_or("cpu_utilization")
            .to_string();
        let target_metric_value = required_f64(id, table, "target_value")?;
        let min_capacity = required_u32(id, table, "min_capacity")?;
        let max_capacity = required_u32(id, table, "max_capacity")?;
        let scale_out_cooldown = optional_duration(id, table, "scale_out_cooldown")?
            .unwrap_or(Duration::from_secs(60));
        let scale_in_cooldown = optional_duration(id, table, "scale_in_cooldown")?
            .unwrap_or(Duration::from_secs(300));

        let policy = Self {
            metric_name,
            target_metric_value,
            min_capacity,
            max_capacity,
            scale_out_cooldown,
            scale_in_cooldown,
        };
        policy.validate(id)?;
        Ok(Some(policy))
    }

    pub fn validate(&self, resource: &str) -> CoreResult<()> {
        if !(self.target_metric_value > 0.0) {
            return Err(CoreError::config(resource, "scaling target_value must be positive"));
        }
        if self.min_capacity > self.max_capacity {
            return Err(CoreError::config(
                resource,
                format!(
                    "scaling min_capacity {} exceeds max_capacity {}",
                    self.min_capacity, self.max_capacity
                ),
            ));
        }
        Ok(())
    }

    /// Clamp a capacity into `[min_capacity, max_capacity]`.
    pub fn clamp(&self, capacity: u32) -> u32 {
        capacity.clamp(self.min_capacity, self.max_capacity)
    }
}

// ── Alarms ────────────────────────────────────────────────────────

/// How a sample is compared against an alarm threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "GT")]
    GreaterThan,
    #[serde(rename = "GE")]
    GreaterOrEqual,
    #[serde(rename = "LT")]
    LessThan,
    #[serde(rename = "LE")]
    LessOrEqual,
}

impl Comparison {
    /// Whether `value` breaches `threshold` under this comparison.
    pub fn breaches(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::LessThan => value < threshold,
            Comparison::LessOrEqual => value <= threshold,
        }
    }
}

impl FromStr for Comparison {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GT" | ">" => Ok(Comparison::GreaterThan),
            "GE" | ">=" => Ok(Comparison::GreaterOrEqual),
            "LT" | "<" => Ok(Comparison::LessThan),
            "LE" | "<=" => Ok(Comparison::LessOrEqual),
            other => Err(CoreError::config("alarm", format!("unknown comparison {other:?}"))),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparison::GreaterThan => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::LessThan => "<",
            Comparison::LessOrEqual => "<=",
        })
    }
}

/// Alarm state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Ok,
    Alarm,
    InsufficientData,
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlarmState::Ok => "OK",
            AlarmState::Alarm => "ALARM",
            AlarmState::InsufficientData => "INSUFFICIENT_DATA",
        })
    }
}

/// Threshold alarm over a metric stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmSpec {
    pub alarm_id: String,
    /// The monitored resource's handle reference (`app.handle`).
    pub target: AttributeRef,
    pub metric_name: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub evaluation_periods: u32,
    pub period: Duration,
    /// Silence longer than this forces `INSUFFICIENT_DATA`.
    pub staleness: Duration,
    pub alarm_actions: Vec<String>,
    pub ok_actions: Vec<String>,
    pub insufficient_data_actions: Vec<String>,
}

impl AlarmSpec {
    /// Read an alarm definition out of an `alarm` resource.
    pub fn from_resource(resource: &Resource) -> CoreResult<Self> {
        let id = resource.id.as_str();
        if resource.kind != ResourceKind::Alarm {
            return Err(CoreError::config(id, "not an alarm resource"));
        }
        let config = &resource.config;

        let target = config
            .get("target")
            .and_then(Value::as_attribute_ref)
            .cloned()
            .ok_or_else(|| {
                CoreError::config(id, "alarm target must be a reference like { ref = \"app.handle\" }")
            })?;
        let metric_name = optional_str(config, "metric_name")
            .ok_or_else(|| CoreError::config(id, "alarm metric_name is required"))?
            .to_string();
        let comparison = optional_str(config, "comparison")
            .unwrap_or("GT")
            .parse::<Comparison>()
            .map_err(|e| CoreError::config(id, e.to_string()))?;
        let threshold = required_f64(id, config, "threshold")?;
        let evaluation_periods = optional_u32(id, config, "evaluation_periods")?.unwrap_or(1);
        if evaluation_periods == 0 {
            return Err(CoreError::config(id, "evaluation_periods must be at least 1"));
        }
        let period = optional_duration(id, config, "period")?.unwrap_or(Duration::from_secs(60));
        let staleness = optional_duration(id, config, "staleness")?.unwrap_or(period * 2);

        Ok(Self {
            alarm_id: id.to_string(),
            target,
            metric_name,
            comparison,
            threshold,
            evaluation_periods,
            period,
            staleness,
            alarm_actions: string_list(id, config, "alarm_actions")?,
            ok_actions: string_list(id, config, "ok_actions")?,
            insufficient_data_actions: string_list(id, config, "insufficient_data_actions")?,
        })
    }

    /// Actions to dispatch on entry into `state`.
    pub fn actions_for(&self, state: AlarmState) -> &[String] {
        match state {
            AlarmState::Alarm => &self.alarm_actions,
            AlarmState::Ok => &self.ok_actions,
            AlarmState::InsufficientData => &self.insufficient_data_actions,
        }
    }
}

// ── Config helpers ────────────────────────────────────────────────

fn optional_str<'a>(table: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a str> {
    table.get(key).and_then(Value::as_str)
}

fn required_f64(id: &str, table: &BTreeMap<String, Value>, key: &str) -> CoreResult<f64> {
    table
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| CoreError::config(id, format!("{key} must be a number")))
}

fn optional_u32(id: &str, table: &BTreeMap<String, Value>, key: &str) -> CoreResult<Option<u32>> {
    match table.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .and_then(|i| u32::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| CoreError::config(id, format!("{key} must be a non-negative integer"))),
    }
}

fn required_u32(id: &str, table: &BTreeMap<String, Value>, key: &str) -> CoreResult<u32> {
    optional_u32(id, table, key)?
        .ok_or_else(|| CoreError::config(id, format!("{key} is required")))
}

fn optional_duration(
    id: &str,
    table: &BTreeMap<String, Value>,
    key: &str,
) -> CoreResult<Option<Duration>> {
    match table.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => parse_duration(s).map(Some),
        Some(Value::Int(secs)) => u64::try_from(*secs)
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| CoreError::config(id, format!("{key} must not be negative"))),
        Some(other) => Err(CoreError::config(id, format!("{key}: expected a duration, got {other}"))),
    }
}

fn string_list(id: &str, table: &BTreeMap<String, Value>, key: &str) -> CoreResult<Vec<String>> {
    match table.get(key) {
        None => Ok(Vec::new()),
        Some(Value::List(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CoreError::config(id, format!("{key} entries must be strings")))
            })
            .collect(),
        Some(_) => Err(CoreError::config(id, format!("{key} must be a list of strings"))),
    }
}
