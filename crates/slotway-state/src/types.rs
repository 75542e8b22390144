//! Domain types for the slotway state store.
//!
//! These types represent the persisted state of deployments, their slots,
//! and metric rollups. All types are serializable to/from JSON for storage
//! in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a deployment (one plugin's production target).
pub type DeploymentId = String;

/// Label identifying a slot within a deployment (e.g. `blue`, `green`).
pub type SlotLabel = String;

// ── Deployment ─────────────────────────────────────────────────────

/// One plugin's production rollout target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    /// Identity of the plugin served by this deployment.
    pub plugin_id: String,
    /// Strategy used by the most recent rollout.
    pub strategy: StrategyKind,
    /// Unix timestamp (milliseconds) when the deployment was first created.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) of the last rollout start.
    pub updated_at: u64,
}

/// Kind of rollout strategy, as recorded on a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Immediate,
    BlueGreen,
    Canary,
}

// ── Slot ──────────────────────────────────────────────────────────

/// One physical instance of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slot {
    pub deployment_id: DeploymentId,
    pub label: SlotLabel,
    pub status: SlotStatus,
    /// Share of traffic in integer percent (0-100).
    pub weight: u32,
    pub version: String,
    /// Address the shell loads the plugin UI from.
    pub frontend_url: String,
    /// Address API requests are proxied to.
    pub backend_url: String,
    /// Result of the most recent health check.
    pub health: HealthStatus,
    /// Unix timestamp (milliseconds) when the slot was created.
    pub created_at: u64,
    /// Unix timestamp (milliseconds) of the last change.
    pub updated_at: u64,
}

/// Routing status of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// Eligible for routing.
    Active,
    /// Superseded or not yet activated; kept for fast rollback.
    Inactive,
    /// Taken out of rotation after a failed rollout.
    Draining,
}

/// Health status as determined by health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Slot {
    /// Build the composite key for the slots table.
    pub fn table_key(&self) -> String {
        slot_key(&self.deployment_id, &self.label)
    }

    /// Whether the router may send traffic to this slot.
    pub fn is_active(&self) -> bool {
        self.status == SlotStatus::Active
    }
}

/// Composite slots-table key for a deployment and slot label.
pub fn slot_key(deployment_id: &str, label: &str) -> String {
    format!("{deployment_id}:{label}")
}

// ── Metrics ───────────────────────────────────────────────────────

/// Aggregation of request samples over one flush window.
///
/// Resource-usage snapshots are stored as rollups with zero requests and
/// `memory_bytes` / `cpu_percent` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRollup {
    pub deployment_id: DeploymentId,
    /// Slot the samples were attributed to, if any.
    pub slot: Option<SlotLabel>,
    /// Unix timestamp (milliseconds) of the first sample in the window.
    pub window_start: u64,
    /// Unix timestamp (milliseconds) when the window was closed.
    pub window_end: u64,
    pub request_count: u64,
    /// Requests that completed with status >= 400.
    pub error_count: u64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_avg_ms: f64,
    /// Distinct user ids seen in the window.
    pub active_users: u64,
    /// Distinct session ids seen in the window.
    pub active_sessions: u64,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
}

impl MetricRollup {
    /// Build the composite key for the rollups table.
    ///
    /// `unique` disambiguates rollups closed in the same millisecond.
    pub fn table_key(&self, unique: &str) -> String {
        format!(
            "{}:{:020}:{}:{}",
            self.deployment_id,
            self.window_end,
            self.slot.as_deref().unwrap_or("-"),
            unique
        )
    }
}

/// Lower bound (inclusive) of the rollup keys of a deployment at `at_ms`.
pub fn rollup_key_floor(deployment_id: &str, at_ms: u64) -> String {
    format!("{deployment_id}:{at_ms:020}")
}
