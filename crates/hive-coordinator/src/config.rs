use hive_core::{HiveError, HiveResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tuning knobs for a [`Coordinator`](crate::Coordinator).
///
/// Every field has a serde default so a partial TOML table is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Ceiling on concurrently active tasks.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Minimum aggregated confidence for a consensus to be accepted.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// Number of workers asked to join a consensus round.
    #[serde(default = "default_consensus_size")]
    pub consensus_size: usize,
    /// Run tasks in consensus mode unless the submitter says otherwise.
    #[serde(default)]
    pub enable_consensus: bool,
    /// Rank by specialty and workload; when off, take the first eligible worker.
    #[serde(default = "default_true")]
    pub enable_load_balancing: bool,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Upper bound on a single worker health probe.
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    /// Idle sleep of the drain loop between queue checks.
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Status polling period of `await_result`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Capacity of the worker event channel and the broadcast bus.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Register the built-in specialists on start when no worker was added.
    #[serde(default = "default_true")]
    pub register_builtin_workers: bool,
}

fn default_max_concurrent_tasks() -> usize {
    10
}

fn default_consensus_threshold() -> f64 {
    0.7
}

fn default_consensus_size() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_check_timeout_ms() -> u64 {
    5_000
}

fn default_drain_interval_ms() -> u64 {
    50
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            consensus_threshold: default_consensus_threshold(),
            consensus_size: default_consensus_size(),
            enable_consensus: false,
            enable_load_balancing: true,
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            drain_interval_ms: default_drain_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            default_timeout_ms: default_timeout_ms(),
            event_buffer: default_event_buffer(),
            register_builtin_workers: true,
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> HiveResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| HiveError::Config(format!("Invalid coordinator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> HiveResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HiveError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> HiveResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(HiveError::Config(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.consensus_threshold) {
            return Err(HiveError::Config(format!(
                "consensus_threshold must be within [0, 1], got {}",
                self.consensus_threshold
            )));
        }
        if self.consensus_size < 2 {
            return Err(HiveError::Config(format!(
                "consensus_size must be at least 2, got {}",
                self.consensus_size
            )));
        }
        for (name, value) in [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("health_check_timeout_ms", self.health_check_timeout_ms),
            ("drain_interval_ms", self.drain_interval_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(HiveError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.event_buffer == 0 {
            return Err(HiveError::Config("event_buffer must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
