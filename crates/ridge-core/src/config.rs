//! Engine settings, read from the optional `[engine]` table of a topology
//! file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::CoreResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum provider operations in flight during an apply.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    /// How long a metric stream may stay silent before loops treat it as a
    /// gap (e.g. "3m").
    #[serde(default = "default_staleness")]
    pub metric_staleness: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_parallelism() -> usize {
    4
}

fn default_staleness() -> String {
    "3m".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            retry: RetryConfig::default(),
            metric_staleness: default_staleness(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl EngineConfig {
    pub fn metric_staleness(&self) -> CoreResult<Duration> {
        parse_duration(&self.metric_staleness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_uses_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.metric_staleness().unwrap(), Duration::from_secs(180));
    }

    #[test]
    fn partial_retry_table() {
        let cfg: EngineConfig = toml::from_str(
            r#"
parallelism = 8
[retry]
max_attempts = 2
"#,
        )
        .unwrap();
        assert_eq!(cfg.parallelism, 8);
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.base_delay_ms, 200);
    }
}
