//! Rollout controller: drives one rollout attempt from start to a terminal event.
//!
//! A rollout stages the new version on the free slot label, proves it
//! healthy, moves traffic according to the strategy and finally deactivates
//! the superseded slots. Every slot write is a single synchronous registry
//! transaction, so an attempt interrupted at any await point (operator
//! abort, overall timeout) never leaves a half-applied weight set behind;
//! the rollback path restores the slots captured before the first write.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use slotway_health::{HealthGate, HealthProbe};
use slotway_metrics::{AggregatedMetrics, MetricsCollector, TimeRange};
use slotway_router::{RouterError, SlotRegistry};
use slotway_state::{HealthStatus, Slot, SlotStatus};

use crate::error::RolloutError;
use crate::events::{EventDraft, EventLog, EventStatus, RolloutEventType};
use crate::strategy::{RolloutPlan, RolloutStrategy};

/// Slot labels a deployment alternates between.
pub const SLOT_LABELS: [&str; 2] = ["blue", "green"];

/// Request metrics of one slot, as seen by the controller.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Everything recorded for `slot` since `since_ms`, including samples
    /// that have not been persisted yet.
    async fn window_metrics(
        &self,
        deployment_id: &str,
        slot: &str,
        since_ms: u64,
    ) -> anyhow::Result<AggregatedMetrics>;
}

#[async_trait]
impl MetricsSource for MetricsCollector {
    async fn window_metrics(
        &self,
        deployment_id: &str,
        slot: &str,
        since_ms: u64,
    ) -> anyhow::Result<AggregatedMetrics> {
        // Buffered samples only count once they are in a rollup.
        self.flush().await.context("flush before metrics window")?;
        self.get_slot_metrics(deployment_id, slot, TimeRange::new(since_ms, now_ms()))
            .await
    }
}

/// Deployment-wide defaults a plan may override.
#[derive(Debug, Clone)]
pub struct RolloutSettings {
    /// Overall limit for one attempt.
    pub timeout: Duration,
    /// `{deployment}` and `{slot}` are substituted.
    pub backend_url_template: String,
    pub frontend_url_template: String,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            backend_url_template: "http://{deployment}-{slot}.plugins.internal".to_string(),
            frontend_url_template: "/plugins/{deployment}/{slot}/".to_string(),
        }
    }
}

/// Render a URL template for one slot.
pub fn render_url(template: &str, deployment_id: &str, slot: &str) -> String {
    template
        .replace("{deployment}", deployment_id)
        .replace("{slot}", slot)
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RolloutOutcome {
    Completed,
    RolledBack { reason: String },
    Failed { reason: String },
}

/// Why an attempt left the happy path.
#[derive(Debug)]
enum Abort {
    Health(String),
    Metrics(String),
    Cancelled,
    Timeout(Duration),
    Error(RolloutError),
}

impl From<RouterError> for Abort {
    fn from(e: RouterError) -> Self {
        Abort::Error(RolloutError::Router(e))
    }
}

/// State of one attempt shared by its steps.
struct Attempt<'a> {
    plan: &'a RolloutPlan,
    log: &'a EventLog,
    gate: HealthGate,
    label: String,
    backend_url: String,
    frontend_url: String,
    /// Every slot of the deployment before the first write.
    snapshot: Vec<Slot>,
    /// Slots that were active before the first write.
    stable: Vec<Slot>,
    /// Version of the heaviest stable slot.
    previous_version: Option<String>,
}

impl Attempt<'_> {
    fn deployment(&self) -> &str {
        &self.plan.deployment_id
    }

    fn emit(&self, draft: EventDraft) {
        if let Some(event) = self.log.append(draft) {
            debug!(
                deployment = %self.plan.deployment_id,
                attempt = %event.attempt_id,
                seq = event.seq,
                event = %event.event_type,
                "rollout event"
            );
        }
    }
}

/// Executes rollout plans against the slot registry.
pub struct RolloutController {
    registry: Arc<SlotRegistry>,
    probe: Arc<dyn HealthProbe>,
    metrics: Arc<dyn MetricsSource>,
    settings: RolloutSettings,
}

impl RolloutController {
    pub fn new(
        registry: Arc<SlotRegistry>,
        probe: Arc<dyn HealthProbe>,
        metrics: Arc<dyn MetricsSource>,
        settings: RolloutSettings,
    ) -> Self {
        Self {
            registry,
            probe,
            metrics,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &RolloutSettings {
        &self.settings
    }

    /// Run one attempt to completion. The log always ends with a terminal
    /// event; setting `cancel` to `true` takes the rollback path.
    pub async fn run(
        &self,
        plan: &RolloutPlan,
        log: &EventLog,
        mut cancel: watch::Receiver<bool>,
    ) -> RolloutOutcome {
        let dep = plan.deployment_id.as_str();
        info!(
            deployment = %dep,
            attempt = %log.attempt_id(),
            version = %plan.version,
            strategy = ?plan.strategy.kind(),
            "rollout started"
        );
        log.append(
            EventDraft::new(RolloutEventType::DeployStart, EventStatus::InProgress)
                .version(&plan.version)
                .message(format!("{:?} rollout of {}", plan.strategy.kind(), plan.plugin_id)),
        );

        let attempt = match self.prepare(plan, log) {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(deployment = %dep, error = %e, "rollout could not start");
                log.append(
                    EventDraft::new(RolloutEventType::Failure, EventStatus::Failed)
                        .version(&plan.version)
                        .error(e.to_string()),
                );
                return RolloutOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let timeout = plan
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.timeout);

        let result = tokio::select! {
            r = tokio::time::timeout(timeout, self.execute(&attempt)) => {
                r.unwrap_or(Err(Abort::Timeout(timeout)))
            }
            _ = cancelled(&mut cancel) => Err(Abort::Cancelled),
        };

        match result {
            Ok(()) => {
                info!(
                    deployment = %dep,
                    slot = %attempt.label,
                    version = %plan.version,
                    "rollout complete"
                );
                attempt.emit(
                    EventDraft::new(RolloutEventType::DeployComplete, EventStatus::Success)
                        .slot(&attempt.label)
                        .version(&plan.version)
                        .traffic(100),
                );
                RolloutOutcome::Completed
            }
            Err(abort) => self.roll_back(&attempt, abort),
        }
    }

    /// Pick the slot label, build the health gate and capture the snapshot.
    fn prepare<'a>(
        &self,
        plan: &'a RolloutPlan,
        log: &'a EventLog,
    ) -> Result<Attempt<'a>, RolloutError> {
        let dep = plan.deployment_id.as_str();
        let gate = HealthGate::new(
            Arc::clone(&self.probe),
            &plan.health_check,
            plan.strategy.success_threshold(),
        )?;

        let snapshot = self.registry.slots_uncached(dep)?;
        let stable: Vec<Slot> = snapshot.iter().filter(|s| s.is_active()).cloned().collect();
        let label = free_label(&snapshot).ok_or_else(|| {
            RolloutError::InvalidPlan(format!(
                "deployment {dep} has no free slot, both {} and {} are active",
                SLOT_LABELS[0], SLOT_LABELS[1]
            ))
        })?;
        let previous_version = stable
            .iter()
            .max_by_key(|s| s.weight)
            .map(|s| s.version.clone());

        let backend_url = plan
            .backend_url
            .clone()
            .unwrap_or_else(|| render_url(&self.settings.backend_url_template, dep, &label));
        let frontend_url = plan
            .frontend_url
            .clone()
            .unwrap_or_else(|| render_url(&self.settings.frontend_url_template, dep, &label));

        Ok(Attempt {
            plan,
            log,
            gate,
            label,
            backend_url,
            frontend_url,
            snapshot,
            stable,
            previous_version,
        })
    }

    async fn execute(&self, a: &Attempt<'_>) -> Result<(), Abort> {
        self.stage(a)?;

        if a.stable.is_empty() {
            // First deployment: prove the slot healthy before it takes traffic.
            self.health_check(a).await?;
            self.shift(a, 100)?;
            return self.finalize(a);
        }

        match &a.plan.strategy {
            RolloutStrategy::Immediate => {
                self.shift(a, 100)?;
                self.health_check(a).await?;
            }
            RolloutStrategy::BlueGreen => {
                self.health_check(a).await?;
                self.shift(a, 100)?;
                self.health_check(a).await?;
            }
            RolloutStrategy::Canary(cfg) => {
                self.health_check(a).await?;
                let mut weight = cfg.initial_percent;
                let mut since = now_ms();
                self.shift(a, weight)?;

                loop {
                    tokio::time::sleep(cfg.interval()).await;
                    self.health_check(a).await?;
                    if !self.metrics_check(a, since).await? {
                        info!(
                            deployment = %a.deployment(),
                            slot = %a.label,
                            weight,
                            "no requests on the new slot yet, holding traffic"
                        );
                        continue;
                    }
                    if weight >= 100 {
                        break;
                    }
                    weight = cfg.next_weight(weight);
                    since = now_ms();
                    self.shift(a, weight)?;
                }
            }
        }

        self.finalize(a)
    }

    /// Write the new version onto the free label, inactive and without traffic.
    fn stage(&self, a: &Attempt<'_>) -> Result<(), Abort> {
        let now = now_ms();
        let created_at = a
            .snapshot
            .iter()
            .find(|s| s.label == a.label)
            .map(|s| s.created_at)
            .unwrap_or(now);
        let slot = Slot {
            deployment_id: a.deployment().to_string(),
            label: a.label.clone(),
            status: SlotStatus::Inactive,
            weight: 0,
            version: a.plan.version.clone(),
            frontend_url: a.frontend_url.clone(),
            backend_url: a.backend_url.clone(),
            health: HealthStatus::Unknown,
            created_at,
            updated_at: now,
        };
        self.registry.apply_slots(a.deployment(), vec![slot])?;
        debug!(deployment = %a.deployment(), slot = %a.label, "new version staged");
        Ok(())
    }

    /// Give the new slot `weight` percent; stable slots share the rest in
    /// proportion to their weights before the rollout.
    fn shift(&self, a: &Attempt<'_>, weight: u32) -> Result<(), Abort> {
        let dep = a.deployment();
        let mut changes = Vec::with_capacity(a.stable.len() + 1);

        let mut new_slot = self.registry.slot(dep, &a.label)?;
        new_slot.status = SlotStatus::Active;
        new_slot.weight = weight;
        changes.push(new_slot);

        for (label, share) in split_remaining(&a.stable, 100 - weight) {
            let mut slot = self.registry.slot(dep, &label)?;
            slot.status = SlotStatus::Active;
            slot.weight = share;
            changes.push(slot);
        }

        self.registry.apply_slots(dep, changes)?;
        info!(deployment = %dep, slot = %a.label, weight, "traffic shifted");
        a.emit(
            EventDraft::new(RolloutEventType::TrafficShift, EventStatus::Success)
                .slot(&a.label)
                .version(&a.plan.version)
                .traffic(weight),
        );
        Ok(())
    }

    async fn health_check(&self, a: &Attempt<'_>) -> Result<(), Abort> {
        let dep = a.deployment();
        match a.gate.check(&a.backend_url).await {
            Ok(probes) => {
                self.registry
                    .set_health(dep, &a.label, HealthStatus::Healthy)?;
                a.emit(
                    EventDraft::new(RolloutEventType::HealthCheck, EventStatus::Success)
                        .slot(&a.label)
                        .version(&a.plan.version)
                        .message(format!("passed after {probes} probe(s)")),
                );
                Ok(())
            }
            Err(e) => {
                self.registry
                    .set_health(dep, &a.label, HealthStatus::Unhealthy)?;
                a.emit(
                    EventDraft::new(RolloutEventType::HealthCheck, EventStatus::Failed)
                        .slot(&a.label)
                        .version(&a.plan.version)
                        .error(e.to_string()),
                );
                if a.plan.rollback.on_health_check_failure {
                    Err(Abort::Health(e.to_string()))
                } else {
                    warn!(
                        deployment = %dep,
                        slot = %a.label,
                        error = %e,
                        "health check failed, continuing as configured"
                    );
                    Ok(())
                }
            }
        }
    }

    /// Compare the new slot's metrics since `since_ms` with the ceilings.
    /// `Ok(false)` means the window saw no requests and proves nothing.
    async fn metrics_check(&self, a: &Attempt<'_>, since_ms: u64) -> Result<bool, Abort> {
        let m = self
            .metrics
            .window_metrics(a.deployment(), &a.label, since_ms)
            .await
            .map_err(|e| Abort::Metrics(format!("metrics unavailable: {e:#}")))?;

        if m.request_count == 0 {
            debug!(deployment = %a.deployment(), slot = %a.label, "no requests in window");
            return Ok(false);
        }
        let limits = &a.plan.rollback;
        if m.error_rate > limits.max_error_rate {
            return Err(Abort::Metrics(format!(
                "error rate {:.4} above {:.4}",
                m.error_rate, limits.max_error_rate
            )));
        }
        if m.latency_p99_ms > limits.max_p99_latency_ms {
            return Err(Abort::Metrics(format!(
                "p99 latency {:.1}ms above {:.1}ms",
                m.latency_p99_ms, limits.max_p99_latency_ms
            )));
        }
        debug!(
            deployment = %a.deployment(),
            slot = %a.label,
            requests = m.request_count,
            error_rate = m.error_rate,
            p99 = m.latency_p99_ms,
            "metrics within limits"
        );
        Ok(true)
    }

    /// Deactivate every superseded slot.
    fn finalize(&self, a: &Attempt<'_>) -> Result<(), Abort> {
        let dep = a.deployment();
        let mut changes = Vec::new();
        for stable in &a.stable {
            let mut slot = self.registry.slot(dep, &stable.label)?;
            slot.status = SlotStatus::Inactive;
            slot.weight = 0;
            changes.push(slot);
        }
        if !changes.is_empty() {
            self.registry.apply_slots(dep, changes)?;
        }
        Ok(())
    }

    /// Restore the snapshot and emit the terminal event for `abort`.
    fn roll_back(&self, a: &Attempt<'_>, abort: Abort) -> RolloutOutcome {
        let dep = a.deployment();
        let reason = match &abort {
            Abort::Health(r) | Abort::Metrics(r) => r.clone(),
            Abort::Cancelled => "aborted by operator".to_string(),
            Abort::Timeout(limit) => RolloutError::DeploymentTimeout(*limit).to_string(),
            Abort::Error(e) => e.to_string(),
        };
        warn!(deployment = %dep, slot = %a.label, %reason, "rolling back");

        if let Err(e) = self.restore(a) {
            let reason = format!("{reason}; rollback failed: {e}");
            a.emit(
                EventDraft::new(RolloutEventType::Failure, EventStatus::Failed)
                    .slot(&a.label)
                    .version(&a.plan.version)
                    .error(reason.clone()),
            );
            return RolloutOutcome::Failed { reason };
        }

        let restored = match &a.previous_version {
            Some(v) => format!("restored version {v}"),
            None => "no previous version to restore".to_string(),
        };

        match abort {
            Abort::Timeout(_) | Abort::Error(_) => {
                let mut draft = EventDraft::new(RolloutEventType::Failure, EventStatus::Failed)
                    .slot(&a.label)
                    .error(reason.clone())
                    .message(restored);
                if let Some(v) = &a.previous_version {
                    draft = draft.version(v);
                }
                a.emit(draft);
                RolloutOutcome::Failed { reason }
            }
            Abort::Health(_) | Abort::Metrics(_) | Abort::Cancelled => {
                let mut draft = EventDraft::new(RolloutEventType::Rollback, EventStatus::Failed)
                    .slot(&a.label)
                    .error(reason.clone())
                    .message(restored);
                if let Some(v) = &a.previous_version {
                    draft = draft.version(v).traffic(100);
                }
                a.emit(draft);
                RolloutOutcome::RolledBack { reason }
            }
        }
    }

    /// Put every pre-existing slot back as it was and take the new slot out
    /// of rotation in one write.
    fn restore(&self, a: &Attempt<'_>) -> Result<(), RolloutError> {
        let dep = a.deployment();
        let mut changes: Vec<Slot> = a
            .snapshot
            .iter()
            .filter(|s| s.label != a.label)
            .cloned()
            .collect();

        if let Some(mut new_slot) = self.registry.store().get_slot(dep, &a.label)? {
            new_slot.weight = 0;
            new_slot.status = if a.stable.is_empty() {
                SlotStatus::Inactive
            } else {
                SlotStatus::Draining
            };
            changes.push(new_slot);
        }

        if !changes.is_empty() {
            self.registry.apply_slots(dep, changes)?;
        }
        Ok(())
    }
}

/// First slot label that is not active.
fn free_label(slots: &[Slot]) -> Option<String> {
    SLOT_LABELS
        .iter()
        .find(|label| !slots.iter().any(|s| s.label == **label && s.is_active()))
        .map(|label| label.to_string())
}

/// Split `remaining` percent across `stable` in proportion to their weights.
/// Rounding leftovers go to the heaviest slot.
fn split_remaining(stable: &[Slot], remaining: u32) -> Vec<(String, u32)> {
    if stable.is_empty() {
        return Vec::new();
    }
    let total: u32 = stable.iter().map(|s| s.weight).sum();
    let mut shares: BTreeMap<String, u32> = stable
        .iter()
        .map(|s| {
            let share = if total == 0 {
                0
            } else {
                (u64::from(s.weight) * u64::from(remaining) / u64::from(total)) as u32
            };
            (s.label.clone(), share)
        })
        .collect();

    let assigned: u32 = shares.values().sum();
    let heaviest = stable
        .iter()
        .max_by_key(|s| s.weight)
        .map(|s| s.label.clone())
        .unwrap_or_default();
    if let Some(share) = shares.get_mut(&heaviest) {
        *share += remaining - assigned;
    }
    shares.into_iter().collect()
}

/// Resolves once `cancel` holds `true`. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(label: &str, status: SlotStatus, weight: u32) -> Slot {
        Slot {
            deployment_id: "cart".to_string(),
            label: label.to_string(),
            status,
            weight,
            version: "1.0.0".to_string(),
            frontend_url: String::new(),
            backend_url: String::new(),
            health: HealthStatus::Unknown,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn free_label_prefers_blue() {
        assert_eq!(free_label(&[]).as_deref(), Some("blue"));
        assert_eq!(
            free_label(&[slot("blue", SlotStatus::Active, 100)]).as_deref(),
            Some("green")
        );
        assert_eq!(
            free_label(&[
                slot("blue", SlotStatus::Inactive, 0),
                slot("green", SlotStatus::Active, 100)
            ])
            .as_deref(),
            Some("blue")
        );
        assert!(free_label(&[
            slot("blue", SlotStatus::Active, 50),
            slot("green", SlotStatus::Active, 50)
        ])
        .is_none());
    }

    #[test]
    fn split_single_stable_slot() {
        let stable = vec![slot("blue", SlotStatus::Active, 100)];
        assert_eq!(split_remaining(&stable, 70), vec![("blue".to_string(), 70)]);
        assert_eq!(split_remaining(&stable, 0), vec![("blue".to_string(), 0)]);
    }

    #[test]
    fn split_is_proportional_and_sums() {
        let stable = vec![
            slot("a", SlotStatus::Active, 67),
            slot("b", SlotStatus::Active, 33),
        ];
        let shares = split_remaining(&stable, 95);
        let sum: u32 = shares.iter().map(|(_, w)| w).sum();
        assert_eq!(sum, 95);
        assert_eq!(shares, vec![("a".to_string(), 64), ("b".to_string(), 31)]);
    }

    #[test]
    fn render_url_substitutes() {
        assert_eq!(
            render_url("http://{deployment}-{slot}.plugins.internal", "cart", "green"),
            "http://cart-green.plugins.internal"
        );
    }
}
