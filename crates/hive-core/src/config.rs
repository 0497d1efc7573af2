use crate::{HiveError, HiveResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Rule deciding how a request resolves when subtasks fail permanently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Any permanently failed subtask fails the whole request.
    #[default]
    FailFast,
    /// The request completes with partial results and `complete = false`.
    BestEffort,
}

/// Tunables for lease, heartbeat, retry, and aggregation behavior.
///
/// All durations are seconds in the serialized form. The lease duration
/// bounds how long a crashed worker can hold a subtask; the heartbeat
/// timeout bounds how long a dead worker goes undetected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// How long a claim stays valid without renewal.
    pub lease_secs: u64,
    /// How long a worker may go silent before being declared dead.
    pub heartbeat_timeout_secs: u64,
    /// Interval of the background sweeps. Defaults to half the heartbeat
    /// timeout when unset.
    pub sweep_interval_secs: Option<u64>,
    /// Retry budget per subtask before it fails permanently.
    pub max_retries: u32,
    /// How the aggregator resolves requests with failed subtasks.
    pub aggregation_policy: AggregationPolicy,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            lease_secs: 120,
            heartbeat_timeout_secs: 30,
            sweep_interval_secs: None,
            max_retries: 3,
            aggregation_policy: AggregationPolicy::default(),
        }
    }
}

impl HiveConfig {
    /// Parses a config from TOML text and validates it.
    pub fn from_toml_str(text: &str) -> HiveResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| HiveError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> HiveResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Rejects configurations that would make the sweeps meaningless.
    pub fn validate(&self) -> HiveResult<()> {
        if self.lease_secs == 0 {
            return Err(HiveError::Config("lease_secs must be > 0".to_string()));
        }
        if self.heartbeat_timeout_secs == 0 {
            return Err(HiveError::Config(
                "heartbeat_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.sweep_interval_secs == Some(0) {
            return Err(HiveError::Config(
                "sweep_interval_secs must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// The lease duration as a `chrono::Duration` for expiry arithmetic.
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs as i64)
    }

    /// The heartbeat timeout as a `chrono::Duration`.
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    /// The sweep interval. Half the heartbeat timeout unless overridden,
    /// never below one second.
    pub fn sweep_interval(&self) -> Duration {
        let secs = self
            .sweep_interval_secs
            .unwrap_or_else(|| (self.heartbeat_timeout_secs / 2).max(1));
        Duration::from_secs(secs.max(1))
    }
}
