//! Rollout strategies and the plan that describes one rollout.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use slotway_health::HealthCheckConfig;
use slotway_state::StrategyKind;

use crate::error::{RolloutError, RolloutResult};

/// How to move traffic from the current version to the new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RolloutStrategy {
    /// Switch all traffic at once, then verify.
    Immediate,
    /// Verify the new slot in isolation, switch all traffic, verify again.
    BlueGreen,
    /// Ramp traffic to the new slot in steps, gated by health and metrics.
    Canary(CanaryConfig),
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self::Canary(CanaryConfig::default())
    }
}

impl RolloutStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            RolloutStrategy::Immediate => StrategyKind::Immediate,
            RolloutStrategy::BlueGreen => StrategyKind::BlueGreen,
            RolloutStrategy::Canary(_) => StrategyKind::Canary,
        }
    }

    /// Consecutive successful probes a health check needs to pass.
    pub fn success_threshold(&self) -> u32 {
        match self {
            RolloutStrategy::Canary(cfg) => cfg.success_threshold,
            _ => 1,
        }
    }
}

/// Configuration for canary deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Traffic percent the new slot starts with (1-100).
    pub initial_percent: u32,
    /// Percent added after each passing interval (1-100).
    pub increment_percent: u32,
    /// Seconds to observe each step before the next check.
    pub interval_secs: u64,
    /// Consecutive successful probes needed for a health check to pass.
    pub success_threshold: u32,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            initial_percent: 10,
            increment_percent: 10,
            interval_secs: 60,
            success_threshold: 1,
        }
    }
}

impl CanaryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Weight after one more step from `current`.
    pub fn next_weight(&self, current: u32) -> u32 {
        current.saturating_add(self.increment_percent).min(100)
    }
}

/// Metric ceilings that trigger a rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Errors / requests above which the rollout is reverted.
    pub max_error_rate: f64,
    /// p99 latency above which the rollout is reverted.
    pub max_p99_latency_ms: f64,
    /// Revert when the health check threshold is exceeded.
    pub on_health_check_failure: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            max_p99_latency_ms: 5000.0,
            on_health_check_failure: true,
        }
    }
}

/// Everything needed to run one rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutPlan {
    /// Filled from the request path by the API.
    #[serde(default)]
    pub deployment_id: String,
    pub plugin_id: String,
    pub version: String,
    #[serde(default)]
    pub strategy: RolloutStrategy,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    /// Overrides the configured backend URL template.
    #[serde(default)]
    pub backend_url: Option<String>,
    /// Overrides the configured frontend URL template.
    #[serde(default)]
    pub frontend_url: Option<String>,
    /// Overrides the configured overall timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl RolloutPlan {
    pub fn new(deployment_id: &str, plugin_id: &str, version: &str, strategy: RolloutStrategy) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            plugin_id: plugin_id.to_string(),
            version: version.to_string(),
            strategy,
            health_check: HealthCheckConfig::default(),
            rollback: RollbackConfig::default(),
            backend_url: None,
            frontend_url: None,
            timeout_secs: None,
        }
    }

    /// Reject plans that cannot be executed.
    pub fn validate(&self) -> RolloutResult<()> {
        let invalid = |msg: String| Err(RolloutError::InvalidPlan(msg));

        if self.deployment_id.trim().is_empty() {
            return invalid("deployment id is empty".to_string());
        }
        if self.deployment_id.contains(':') {
            return invalid(format!("deployment id '{}' contains ':'", self.deployment_id));
        }
        if self.plugin_id.trim().is_empty() {
            return invalid("plugin id is empty".to_string());
        }
        if self.version.trim().is_empty() {
            return invalid("version is empty".to_string());
        }
        if let RolloutStrategy::Canary(cfg) = &self.strategy {
            if !(1..=100).contains(&cfg.initial_percent) {
                return invalid(format!(
                    "canary initial_percent {} not in 1..=100",
                    cfg.initial_percent
                ));
            }
            if !(1..=100).contains(&cfg.increment_percent) {
                return invalid(format!(
                    "canary increment_percent {} not in 1..=100",
                    cfg.increment_percent
                ));
            }
            if cfg.success_threshold == 0 {
                return invalid("canary success_threshold must be at least 1".to_string());
            }
        }
        if !(0.0..=1.0).contains(&self.rollback.max_error_rate) {
            return invalid(format!(
                "max_error_rate {} not in 0.0..=1.0",
                self.rollback.max_error_rate
            ));
        }
        if self.rollback.max_p99_latency_ms <= 0.0 {
            return invalid("max_p99_latency_ms must be positive".to_string());
        }
        if self.timeout_secs == Some(0) {
            return invalid("timeout_secs must be positive".to_string());
        }
        self.health_check
            .validate()
            .map_err(|e| RolloutError::InvalidPlan(e.to_string()))
    }
}
