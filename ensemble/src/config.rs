//! Orchestrator configuration
//!
//! Loaded from TOML. Every field has a default so an empty file is valid.

use crate::error::Result;
use crate::topology::Role;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main orchestrator configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub impact: ImpactConfig,
    #[serde(default)]
    pub transition: TransitionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: OrchestratorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from file path, falling back to defaults when it is missing
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::OrchestratorError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }
}

/// Identity of the managed service as seen by the scheduler
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Service name, used as plan name prefix and log field
    #[serde(default = "default_service_name")]
    pub name: String,

    /// OS user the node tasks run as
    #[serde(default = "default_task_user")]
    pub user: String,
}

fn default_service_name() -> String {
    "elastic".to_string()
}

fn default_task_user() -> String {
    "nobody".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            user: default_task_user(),
        }
    }
}

/// Step execution bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Timeout for a single scheduler call in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Time a launched task has to report running, in milliseconds
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_ms: u64,

    /// Interval between task observations while waiting for a launch
    #[serde(default = "default_observe_interval")]
    pub observe_interval_ms: u64,

    /// Retries of a timed-out step before it becomes a failure
    #[serde(default = "default_max_timeout_retries")]
    pub max_timeout_retries: u32,

    /// How long a step waits for another operation's lease on its instance
    #[serde(default = "default_lease_wait")]
    pub lease_wait_ms: u64,

    /// Finished deployment and replacement plans kept for status queries
    #[serde(default = "default_plan_history")]
    pub plan_history: usize,
}

fn default_call_timeout() -> u64 {
    30_000
}

fn default_launch_timeout() -> u64 {
    300_000
}

fn default_observe_interval() -> u64 {
    1_000
}

fn default_max_timeout_retries() -> u32 {
    3
}

fn default_lease_wait() -> u64 {
    600_000
}

fn default_plan_history() -> usize {
    100
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            launch_timeout_ms: default_launch_timeout(),
            observe_interval_ms: default_observe_interval(),
            max_timeout_retries: default_max_timeout_retries(),
            lease_wait_ms: default_lease_wait(),
            plan_history: default_plan_history(),
        }
    }
}

impl ExecutionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn observe_interval(&self) -> Duration {
        Duration::from_millis(self.observe_interval_ms)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_ms)
    }
}

/// Recovery loop and settle behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecoveryConfig {
    /// Interval of the recovery control loop
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Interval between replication health polls while settling
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,

    /// Maximum time to wait for GREEN after a plan completes
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_ms: u64,

    /// Failed transient recoveries before the instance is replaced onto another host
    #[serde(default = "default_permanent_failure_threshold")]
    pub permanent_failure_threshold: u32,

    /// Upper bound of the delay before retrying a failed recovery
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_tick_interval() -> u64 {
    2_000
}

fn default_health_poll_interval() -> u64 {
    1_000
}

fn default_settle_timeout() -> u64 {
    600_000
}

fn default_permanent_failure_threshold() -> u32 {
    3
}

fn default_max_backoff() -> u64 {
    60_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            health_poll_interval_ms: default_health_poll_interval(),
            settle_timeout_ms: default_settle_timeout(),
            permanent_failure_threshold: default_permanent_failure_threshold(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RecoveryConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    /// Delay before the next recovery after `failures` consecutive failures:
    /// one tick, doubling per failure up to `max_backoff_ms`
    pub fn retry_backoff(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.saturating_sub(1).min(20);
        let millis = self
            .tick_interval_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// A role whose membership change restarts other roles
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CouplingRule {
    pub source: Role,
    pub restarts: Vec<Role>,
}

/// Restart-impact analysis settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImpactConfig {
    /// Role coupling table (default: data membership restarts master)
    #[serde(default = "default_couplings")]
    pub couplings: Vec<CouplingRule>,

    /// Whether scaling a source role down also restarts its dependents
    #[serde(default)]
    pub scale_down_restarts_dependents: bool,
}

fn default_couplings() -> Vec<CouplingRule> {
    vec![CouplingRule {
        source: Role::Data,
        restarts: vec![Role::Master],
    }]
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            couplings: default_couplings(),
            scale_down_restarts_dependents: false,
        }
    }
}

/// Mode transition settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransitionConfig {
    /// Maximum time a topology sub-step may take to complete and settle
    #[serde(default = "default_plan_wait")]
    pub plan_wait_ms: u64,
}

fn default_plan_wait() -> u64 {
    3_600_000
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            plan_wait_ms: default_plan_wait(),
        }
    }
}

impl TransitionConfig {
    pub fn plan_wait(&self) -> Duration {
        Duration::from_millis(self.plan_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: OrchestratorConfig = toml::from_str("").unwrap();
        assert_eq!(config.service.name, "elastic");
        assert_eq!(config.execution.max_timeout_retries, 3);
        assert_eq!(config.impact.couplings, default_couplings());
        assert!(!config.impact.scale_down_restarts_dependents);
    }

    #[test]
    fn test_partial_override() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
[execution]
call_timeout_ms = 500

[impact]
scale_down_restarts_dependents = true

[[impact.couplings]]
source = "data"
restarts = ["master", "coordinator"]
"#,
        )
        .unwrap();
        assert_eq!(config.execution.call_timeout(), Duration::from_millis(500));
        assert_eq!(config.execution.launch_timeout_ms, default_launch_timeout());
        assert!(config.impact.scale_down_restarts_dependents);
        assert_eq!(
            config.impact.couplings[0].restarts,
            vec![Role::Master, Role::Coordinator]
        );
    }

    #[test]
    fn test_recovery_backoff_doubles_up_to_cap() {
        let config = RecoveryConfig {
            tick_interval_ms: 100,
            max_backoff_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.retry_backoff(1), Duration::from_millis(100));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(200));
        assert_eq!(config.retry_backoff(3), Duration::from_millis(400));
        assert_eq!(config.retry_backoff(4), Duration::from_millis(500));
        assert_eq!(config.retry_backoff(64), Duration::from_millis(500));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conf/ensemble.toml");

        let mut config = OrchestratorConfig::default();
        config.service.name = "search-prod".to_string();
        config.save(&path).unwrap();

        let loaded = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(loaded.service.name, "search-prod");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp = TempDir::new().unwrap();
        let config = OrchestratorConfig::load_or_default(&temp.path().join("nope.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
