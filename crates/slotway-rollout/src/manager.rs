//! Rollout manager: starts, tracks and aborts rollout attempts.
//!
//! Each attempt runs on its own task. A deployment has at most one running
//! attempt; different deployments roll out concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use slotway_state::{Deployment, StrategyKind};

use crate::controller::RolloutController;
use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventLog, EventStream, RolloutEvent, RolloutEventType};
use crate::strategy::RolloutPlan;

/// Lifecycle state of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Running,
    Completed,
    RolledBack,
    Failed,
}

/// Phase an attempt is in, derived from its latest event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    Start,
    HealthCheck,
    TrafficShift,
    Complete,
    Rollback,
    Failure,
}

impl From<RolloutEventType> for RolloutPhase {
    fn from(t: RolloutEventType) -> Self {
        match t {
            RolloutEventType::DeployStart => RolloutPhase::Start,
            RolloutEventType::HealthCheck => RolloutPhase::HealthCheck,
            RolloutEventType::TrafficShift => RolloutPhase::TrafficShift,
            RolloutEventType::DeployComplete => RolloutPhase::Complete,
            RolloutEventType::Rollback => RolloutPhase::Rollback,
            RolloutEventType::Failure => RolloutPhase::Failure,
        }
    }
}

/// Public view of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt_id: String,
    pub deployment_id: String,
    pub version: String,
    pub strategy: StrategyKind,
    pub state: AttemptState,
    pub phase: RolloutPhase,
    /// Traffic percent of the new slot at the last shift.
    pub traffic_percent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
}

struct AttemptEntry {
    deployment_id: String,
    version: String,
    strategy: StrategyKind,
    started_at: u64,
    log: Arc<EventLog>,
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl AttemptEntry {
    /// Running until the log holds its terminal event.
    fn is_running(&self) -> bool {
        !self.log.is_finished()
    }

    /// Unix milliseconds of the terminal event, if any.
    fn finished_at(&self) -> Option<u64> {
        self.log.last().filter(|e| e.is_terminal()).map(|e| e.timestamp)
    }

    fn summary(&self) -> AttemptSummary {
        let events = self.log.since(0);
        let phase = events
            .last()
            .map(|e| RolloutPhase::from(e.event_type))
            .unwrap_or(RolloutPhase::Start);
        let terminal = events.last().filter(|e| e.is_terminal());
        let state = match terminal.map(|e| e.event_type) {
            None => AttemptState::Running,
            Some(RolloutEventType::DeployComplete) => AttemptState::Completed,
            Some(RolloutEventType::Rollback) => AttemptState::RolledBack,
            Some(_) => AttemptState::Failed,
        };
        let traffic_percent = events
            .iter()
            .rev()
            .find(|e| e.event_type == RolloutEventType::TrafficShift)
            .and_then(|e| e.traffic_percent)
            .unwrap_or(0);
        AttemptSummary {
            attempt_id: self.log.attempt_id().to_string(),
            deployment_id: self.deployment_id.clone(),
            version: self.version.clone(),
            strategy: self.strategy,
            state,
            phase,
            traffic_percent,
            reason: terminal.and_then(|e| e.error.clone()),
            started_at: self.started_at,
            finished_at: terminal.map(|e| e.timestamp),
        }
    }
}

type Attempts = Arc<RwLock<HashMap<String, AttemptEntry>>>;

/// Finished attempts kept in memory before the oldest are evicted.
pub const DEFAULT_MAX_FINISHED: usize = 256;

/// Owns every rollout attempt of this process.
pub struct RolloutManager {
    controller: Arc<RolloutController>,
    attempts: Attempts,
    max_finished: usize,
}

impl RolloutManager {
    pub fn new(controller: Arc<RolloutController>) -> Self {
        Self::with_max_finished(controller, DEFAULT_MAX_FINISHED)
    }

    /// Keep at most `max_finished` finished attempts around.
    pub fn with_max_finished(controller: Arc<RolloutController>, max_finished: usize) -> Self {
        Self {
            controller,
            attempts: Arc::new(RwLock::new(HashMap::new())),
            max_finished,
        }
    }

    pub fn controller(&self) -> &Arc<RolloutController> {
        &self.controller
    }

    /// Validate `plan`, record the deployment and start the attempt.
    ///
    /// Returns the attempt id and a stream over its events.
    pub async fn start(&self, plan: RolloutPlan) -> RolloutResult<(String, EventStream)> {
        plan.validate()?;
        let dep = plan.deployment_id.clone();

        let mut attempts = self.attempts.write().await;
        if let Some((id, _)) = attempts
            .iter()
            .find(|(_, a)| a.deployment_id == dep && a.is_running())
        {
            return Err(RolloutError::AlreadyInProgress {
                deployment: dep,
                attempt: id.clone(),
            });
        }

        self.record_deployment(&plan)?;

        let version = plan.version.clone();
        let strategy = plan.strategy.kind();
        let attempt_id = uuid::Uuid::new_v4().to_string();
        let log = Arc::new(EventLog::new(&attempt_id, &dep));
        let stream = log.stream();
        let (cancel, cancel_rx) = watch::channel(false);

        let controller = Arc::clone(&self.controller);
        let registry = Arc::clone(&self.attempts);
        let task_log = Arc::clone(&log);
        let task_id = attempt_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = controller.run(&plan, &task_log, cancel_rx).await;
            info!(attempt = %task_id, ?outcome, "rollout attempt finished");
            if let Some(entry) = registry.write().await.get_mut(&task_id) {
                entry.handle = None;
            }
        });

        attempts.insert(
            attempt_id.clone(),
            AttemptEntry {
                deployment_id: dep.clone(),
                version,
                strategy,
                started_at: now_ms(),
                log,
                cancel,
                handle: Some(handle),
            },
        );
        evict_oldest_finished(&mut attempts, self.max_finished);
        Ok((attempt_id, stream))
    }

    /// Drop finished attempts whose terminal event is older than `max_age`.
    /// Returns how many were removed.
    pub async fn prune_finished(&self, max_age: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let mut attempts = self.attempts.write().await;
        let before = attempts.len();
        attempts.retain(|_, a| a.finished_at().is_none_or(|at| at >= cutoff));
        let removed = before - attempts.len();
        if removed > 0 {
            debug!(removed, "finished rollout attempts pruned");
        }
        removed
    }

    /// Upsert the deployment record for `plan`.
    fn record_deployment(&self, plan: &RolloutPlan) -> RolloutResult<()> {
        let store = self.controller.registry().store();
        let now = now_ms();
        let deployment = match store.get_deployment(&plan.deployment_id)? {
            Some(mut existing) => {
                existing.plugin_id = plan.plugin_id.clone();
                existing.strategy = plan.strategy.kind();
                existing.updated_at = now;
                existing
            }
            None => Deployment {
                id: plan.deployment_id.clone(),
                plugin_id: plan.plugin_id.clone(),
                strategy: plan.strategy.kind(),
                created_at: now,
                updated_at: now,
            },
        };
        store.put_deployment(&deployment)?;
        Ok(())
    }

    /// Ask a running attempt to roll back. Returns `false` if it already finished.
    pub async fn abort(&self, attempt_id: &str) -> RolloutResult<bool> {
        let attempts = self.attempts.read().await;
        let entry = attempts
            .get(attempt_id)
            .ok_or_else(|| RolloutError::AttemptNotFound(attempt_id.to_string()))?;
        if !entry.is_running() {
            return Ok(false);
        }
        info!(attempt = %attempt_id, deployment = %entry.deployment_id, "rollout abort requested");
        Ok(entry.cancel.send(true).is_ok())
    }

    /// Abort every running attempt and wait for their rollbacks.
    pub async fn abort_all(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut attempts = self.attempts.write().await;
            attempts
                .iter_mut()
                .filter_map(|(id, entry)| {
                    let _ = entry.cancel.send(true);
                    entry.handle.take().map(|h| (id.clone(), h))
                })
                .collect()
        };
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                error!(attempt = %id, error = %e, "rollout task panicked");
            }
        }
    }

    /// Events of an attempt starting at `cursor`.
    pub async fn events(&self, attempt_id: &str, cursor: u64) -> RolloutResult<Vec<RolloutEvent>> {
        Ok(self.log(attempt_id).await?.since(cursor))
    }

    /// Follow an attempt's events from `cursor`.
    pub async fn stream(&self, attempt_id: &str, cursor: u64) -> RolloutResult<EventStream> {
        Ok(self.log(attempt_id).await?.stream_from(cursor))
    }

    pub async fn get(&self, attempt_id: &str) -> RolloutResult<AttemptSummary> {
        let attempts = self.attempts.read().await;
        attempts
            .get(attempt_id)
            .map(AttemptEntry::summary)
            .ok_or_else(|| RolloutError::AttemptNotFound(attempt_id.to_string()))
    }

    /// Every attempt, newest first.
    pub async fn list(&self) -> Vec<AttemptSummary> {
        let attempts = self.attempts.read().await;
        let mut all: Vec<AttemptSummary> = attempts.values().map(AttemptEntry::summary).collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    async fn log(&self, attempt_id: &str) -> RolloutResult<Arc<EventLog>> {
        let attempts = self.attempts.read().await;
        attempts
            .get(attempt_id)
            .map(|a| Arc::clone(&a.log))
            .ok_or_else(|| RolloutError::AttemptNotFound(attempt_id.to_string()))
    }
}

/// Keep the newest `max` finished attempts; running ones are never evicted.
fn evict_oldest_finished(attempts: &mut HashMap<String, AttemptEntry>, max: usize) {
    let mut finished: Vec<(u64, String)> = attempts
        .iter()
        .filter_map(|(id, a)| a.finished_at().map(|at| (at, id.clone())))
        .collect();
    if finished.len() <= max {
        return;
    }
    finished.sort();
    let excess = finished.len() - max;
    for (_, id) in finished.into_iter().take(excess) {
        attempts.remove(&id);
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
    use crate::events::{EventDraft, EventStatus};

    fn entry(id: &str) -> AttemptEntry {
        let (cancel, _) = watch::channel(false);
        AttemptEntry {
            deployment_id: "cart".to_string(),
            version: "2.0.0".to_string(),
            strategy: StrategyKind::Canary,
            started_at: 1,
            log: Arc::new(EventLog::new(id, "cart")),
            cancel,
            handle: None,
        }
    }

    fn finish(entry: &AttemptEntry, event_type: RolloutEventType, error: Option<&str>) {
        let mut draft = EventDraft::new(event_type, EventStatus::Failed);
        if let Some(error) = error {
            draft = draft.error(error);
        }
        entry.log.append(draft).unwrap();
    }

    #[test]
    fn state_follows_the_event_log() {
        let e = entry("a-1");
        e.log
            .append(EventDraft::new(RolloutEventType::DeployStart, EventStatus::InProgress))
            .unwrap();
        e.log
            .append(
                EventDraft::new(RolloutEventType::TrafficShift, EventStatus::Success).traffic(30),
            )
            .unwrap();
        let running = e.summary();
        assert_eq!(running.state, AttemptState::Running);
        assert_eq!(running.traffic_percent, 30);
        assert!(running.finished_at.is_none());
        assert!(e.is_running());

        finish(&e, RolloutEventType::Rollback, Some("error rate 0.2000 above 0.0500"));
        let done = e.summary();
        assert_eq!(done.state, AttemptState::RolledBack);
        assert_eq!(done.phase, RolloutPhase::Rollback);
        assert_eq!(done.reason.as_deref(), Some("error rate 0.2000 above 0.0500"));
        assert!(done.finished_at.is_some());
        assert!(!e.is_running());
    }

    #[test]
    fn terminal_types_map_to_states() {
        for (event_type, state) in [
            (RolloutEventType::DeployComplete, AttemptState::Completed),
            (RolloutEventType::Rollback, AttemptState::RolledBack),
            (RolloutEventType::Failure, AttemptState::Failed),
        ] {
            let e = entry("a-1");
            finish(&e, event_type, None);
            assert_eq!(e.summary().state, state);
        }
    }

    #[test]
    fn eviction_keeps_running_and_newest_finished() {
        let mut attempts = HashMap::new();
        for id in ["old", "mid", "new"] {
            let e = entry(id);
            finish(&e, RolloutEventType::DeployComplete, None);
            attempts.insert(id.to_string(), e);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        attempts.insert("live".to_string(), entry("live"));

        evict_oldest_finished(&mut attempts, 2);
        let mut left: Vec<&str> = attempts.keys().map(String::as_str).collect();
        left.sort();
        assert_eq!(left, vec!["live", "mid", "new"]);

        evict_oldest_finished(&mut attempts, 0);
        assert_eq!(attempts.keys().collect::<Vec<_>>(), vec!["live"]);
    }
}
