//! Health check configuration and consecutive-result tracking.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use slotway_state::HealthStatus;

use crate::error::{HealthError, HealthResult};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == ProbeResult::Healthy
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeResult::Healthy => "healthy",
            ProbeResult::Unhealthy => "non-2xx response",
            ProbeResult::Failed => "probe failed or timed out",
        };
        f.write_str(s)
    }
}

/// Where and how often to probe a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Path appended to the slot's backend URL, e.g. `/health`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Time between probes, e.g. "5s", "500ms", "1m".
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Per-probe timeout.
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Consecutive failures before the slot is unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

fn default_endpoint() -> String {
    "/health".to_string()
}

fn default_interval() -> String {
    "5s".to_string()
}

fn default_timeout() -> String {
    "2s".to_string()
}

fn default_unhealthy_threshold() -> u32 {
    3
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            interval: default_interval(),
            timeout: default_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> HealthResult<Duration> {
        parse_duration(&self.interval)
            .ok_or_else(|| HealthError::InvalidConfig(format!("bad interval '{}'", self.interval)))
    }

    pub fn timeout(&self) -> HealthResult<Duration> {
        parse_duration(&self.timeout)
            .ok_or_else(|| HealthError::InvalidConfig(format!("bad timeout '{}'", self.timeout)))
    }

    /// Check the config can drive a gate.
    pub fn validate(&self) -> HealthResult<()> {
        if !self.endpoint.starts_with('/') {
            return Err(HealthError::InvalidConfig(format!(
                "endpoint '{}' must start with '/'",
                self.endpoint
            )));
        }
        if self.unhealthy_threshold == 0 {
            return Err(HealthError::InvalidConfig(
                "unhealthy_threshold must be at least 1".to_string(),
            ));
        }
        if self.timeout()?.is_zero() {
            return Err(HealthError::InvalidConfig("timeout must be non-zero".to_string()));
        }
        self.interval()?;
        Ok(())
    }
}

/// Tracks consecutive probe results for a single slot.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Threshold before marking unhealthy.
    unhealthy_threshold: u32,
    /// Successes needed to be considered healthy.
    success_threshold: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32, success_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            success_threshold: success_threshold.max(1),
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;

                if self.consecutive_successes >= self.success_threshold {
                    if self.status != HealthStatus::Healthy {
                        debug!(
                            successes = self.consecutive_successes,
                            "slot reported healthy"
                        );
                    }
                    self.status = HealthStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "slot marked unhealthy"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// The success threshold was reached by the current streak.
    pub fn passed(&self) -> bool {
        self.consecutive_successes >= self.success_threshold
    }

    /// The failure threshold was reached by the current streak.
    pub fn failed(&self) -> bool {
        self.consecutive_failures >= self.unhealthy_threshold
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(tracker: &mut HealthTracker, results: &[ProbeResult]) -> Vec<HealthStatus> {
        results.iter().map(|r| tracker.record(*r)).collect()
    }

    #[test]
    fn fresh_slot_is_unknown_until_probed() {
        let tracker = HealthTracker::new(3, 1);
        assert_eq!(tracker.status(), HealthStatus::Unknown);
        assert!(!tracker.passed() && !tracker.failed());
    }

    #[test]
    fn gate_passes_on_single_success_by_default() {
        let mut tracker = HealthTracker::new(3, 1);
        let seen = feed(&mut tracker, &[ProbeResult::Failed, ProbeResult::Healthy]);
        assert_eq!(seen, vec![HealthStatus::Unknown, HealthStatus::Healthy]);
        assert!(tracker.passed());
        assert_eq!(tracker.consecutive_successes(), 1);
    }

    #[test]
    fn timeouts_and_bad_statuses_share_one_streak() {
        let mut tracker = HealthTracker::new(3, 1);
        tracker.record(ProbeResult::Healthy);
        let seen = feed(
            &mut tracker,
            &[ProbeResult::Unhealthy, ProbeResult::Failed, ProbeResult::Unhealthy],
        );
        // Healthy holds until the third failure in a row.
        assert_eq!(
            seen,
            vec![HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Unhealthy]
        );
        assert!(tracker.failed());
    }

    #[test]
    fn interleaved_success_breaks_failure_streak() {
        let mut tracker = HealthTracker::new(3, 1);
        feed(
            &mut tracker,
            &[
                ProbeResult::Failed,
                ProbeResult::Failed,
                ProbeResult::Healthy,
                ProbeResult::Failed,
            ],
        );
        assert_eq!(tracker.consecutive_failures(), 1);
        assert!(!tracker.failed());
    }

    #[test]
    fn canary_success_threshold_needs_a_clean_run() {
        // A canary asking for three good probes in a row.
        let mut tracker = HealthTracker::new(5, 3);
        feed(&mut tracker, &[ProbeResult::Healthy, ProbeResult::Healthy]);
        assert!(!tracker.passed());

        tracker.record(ProbeResult::Failed);
        assert_eq!(tracker.consecutive_successes(), 0);

        let seen = feed(&mut tracker, &[ProbeResult::Healthy; 3]);
        assert_eq!(seen.last(), Some(&HealthStatus::Healthy));
        assert!(tracker.passed());

        // Recovery from unhealthy also takes the full run.
        feed(&mut tracker, &[ProbeResult::Unhealthy; 5]);
        assert_eq!(tracker.status(), HealthStatus::Unhealthy);
        let seen = feed(&mut tracker, &[ProbeResult::Healthy; 3]);
        assert_eq!(
            seen,
            vec![HealthStatus::Unhealthy, HealthStatus::Unhealthy, HealthStatus::Healthy]
        );
    }

    #[test]
    fn zero_thresholds_clamp_to_one() {
        let mut tracker = HealthTracker::new(0, 0);
        tracker.record(ProbeResult::Failed);
        assert!(tracker.failed());
    }

    #[test]
    fn probe_durations() {
        let cases = [
            ("250ms", Some(Duration::from_millis(250))),
            ("1s", Some(Duration::from_secs(1))),
            ("45s", Some(Duration::from_secs(45))),
            ("3m", Some(Duration::from_secs(180))),
            ("7", Some(Duration::from_secs(7))),
            (" 2s ", Some(Duration::from_secs(2))),
            ("soon", None),
            ("ms", None),
        ];
        for (input, want) in cases {
            assert_eq!(parse_duration(input), want, "input {input:?}");
        }
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let config: HealthCheckConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, HealthCheckConfig::default());
        assert_eq!(config.interval().unwrap(), Duration::from_secs(5));
        assert_eq!(config.timeout().unwrap(), Duration::from_secs(2));
        assert_eq!(config.unhealthy_threshold, 3);
        config.validate().unwrap();
    }

    #[test]
    fn config_validation() {
        let bad_endpoint = HealthCheckConfig {
            endpoint: "health".to_string(),
            ..Default::default()
        };
        assert!(bad_endpoint.validate().is_err());

        let bad_interval = HealthCheckConfig {
            interval: "often".to_string(),
            ..Default::default()
        };
        assert!(bad_interval.validate().is_err());

        let zero_timeout = HealthCheckConfig {
            timeout: "0s".to_string(),
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());
    }
}
