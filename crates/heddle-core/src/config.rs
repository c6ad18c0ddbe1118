//! Configuration.
//!
//! Every section has defaults; a config file only needs the keys it changes.
//! Durations are written as integer milliseconds (`*_ms`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::WorkerSpec;
use crate::error::HeddleError;
use crate::policy::Backoff;

/// Env var the binary reads the config path from.
pub const CONFIG_ENV: &str = "HEDDLE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeddleConfig {
    pub orchestrator: OrchestratorConfig,
    pub queues: QueueConfig,
    pub pool: PoolConfig,
    pub workers: Vec<WorkerSpec>,
}

impl HeddleConfig {
    pub fn from_json_str(s: &str) -> Result<Self, HeddleError> {
        serde_json::from_str(s).map_err(|e| HeddleError::Config(e.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, HeddleError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HeddleError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }
}

/// What happens to the rest of a run once one task fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the run at once and stop dispatching.
    #[default]
    FailFast,
    /// Let independent branches finish, then fail the run.
    FailLate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Slack on top of a task's timeout before a started attempt is presumed lost.
    #[serde(rename = "response_grace_ms", with = "duration_ms")]
    pub response_grace: Duration,
    pub failure_policy: FailurePolicy,
    /// Finished runs kept for `run_report`; the oldest are forgotten first.
    pub retain_finished: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            response_grace: Duration::from_secs(5),
            failure_policy: FailurePolicy::FailFast,
            retain_finished: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-queue bound. `None` = unbounded.
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// How long shutdown waits for graceful exits before killing.
    #[serde(rename = "grace_ms", with = "duration_ms")]
    pub grace: Duration,
    pub restart_backoff: Backoff,
    /// Uptime after which a worker's exit no longer counts toward the restart backoff.
    #[serde(rename = "stable_after_ms", with = "duration_ms")]
    pub stable_after: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            grace: Duration::from_secs(2),
            restart_backoff: Backoff::exponential(
                Duration::from_millis(100),
                2.0,
                Duration::from_secs(10),
            ),
            stable_after: Duration::from_secs(30),
        }
    }
}

/// `Duration` <-> integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = HeddleConfig::from_json_str("{}").unwrap();
        assert_eq!(config, HeddleConfig::default());
        assert_eq!(config.orchestrator.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.pool.poll_interval, Duration::from_secs(1));
        assert_eq!(config.pool.stable_after, Duration::from_secs(30));
        assert!(config.workers.is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = HeddleConfig::from_json_str(
            r#"{
                "orchestrator": { "failure_policy": "fail_late", "retain_finished": 16 },
                "queues": { "capacity": 8 },
                "pool": { "grace_ms": 500, "restart_backoff": { "type": "fixed", "delay_ms": 0 } },
                "workers": [ { "id": "worker-1", "queues": ["greet-queue", "react-queue"] } ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.failure_policy, FailurePolicy::FailLate);
        assert_eq!(config.orchestrator.response_grace, Duration::from_secs(5));
        assert_eq!(config.orchestrator.retain_finished, 16);
        assert_eq!(config.queues.capacity, Some(8));
        assert_eq!(config.pool.grace, Duration::from_millis(500));
        assert_eq!(config.pool.poll_interval, Duration::from_secs(1));
        assert_eq!(config.pool.restart_backoff, Backoff::fixed(Duration::ZERO));
        assert_eq!(
            config.workers,
            vec![WorkerSpec::new("worker-1", ["greet-queue", "react-queue"])]
        );
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = HeddleConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, HeddleError::Config(_)));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = HeddleConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, HeddleError::Config(msg) if msg.contains("/definitely/not/here.json")));
    }
}
