//! Rollout event log and its async pull stream.
//!
//! Each rollout attempt owns one append-only `EventLog`. Readers either poll
//! it by cursor or follow it with an `EventStream`, which yields every event
//! in order and ends after the first terminal event.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutEventType {
    DeployStart,
    HealthCheck,
    TrafficShift,
    DeployComplete,
    Rollback,
    Failure,
}

impl RolloutEventType {
    /// Terminal events end an attempt; nothing is appended after them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RolloutEventType::DeployComplete | RolloutEventType::Rollback | RolloutEventType::Failure
        )
    }
}

impl fmt::Display for RolloutEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RolloutEventType::DeployStart => "deploy_start",
            RolloutEventType::HealthCheck => "health_check",
            RolloutEventType::TrafficShift => "traffic_shift",
            RolloutEventType::DeployComplete => "deploy_complete",
            RolloutEventType::Rollback => "rollback",
            RolloutEventType::Failure => "failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    InProgress,
    Success,
    Failed,
}

/// One entry in an attempt's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutEvent {
    /// Position in the log, starting at 0.
    pub seq: u64,
    pub attempt_id: String,
    pub deployment_id: String,
    pub event_type: RolloutEventType,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_percent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl RolloutEvent {
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

/// Fields of an event before the log assigns its sequence and timestamp.
#[derive(Debug, Clone)]
pub struct EventDraft {
    event_type: RolloutEventType,
    status: EventStatus,
    slot: Option<String>,
    version: Option<String>,
    traffic_percent: Option<u32>,
    message: Option<String>,
    error: Option<String>,
}

impl EventDraft {
    pub fn new(event_type: RolloutEventType, status: EventStatus) -> Self {
        Self {
            event_type,
            status,
            slot: None,
            version: None,
            traffic_percent: None,
            message: None,
            error: None,
        }
    }

    pub fn slot(mut self, slot: &str) -> Self {
        self.slot = Some(slot.to_string());
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn traffic(mut self, percent: u32) -> Self {
        self.traffic_percent = Some(percent);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Append-only, in-order event log of one rollout attempt.
pub struct EventLog {
    attempt_id: String,
    deployment_id: String,
    events: RwLock<Vec<RolloutEvent>>,
    appended: watch::Sender<usize>,
}

impl EventLog {
    pub fn new(attempt_id: &str, deployment_id: &str) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            attempt_id: attempt_id.to_string(),
            deployment_id: deployment_id.to_string(),
            events: RwLock::new(Vec::new()),
            appended,
        }
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Append an event and wake followers.
    ///
    /// Once a terminal event was appended the log is sealed and further
    /// drafts are dropped; the returned event is then `None`.
    pub fn append(&self, draft: EventDraft) -> Option<RolloutEvent> {
        let event = {
            let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
            if events.last().is_some_and(RolloutEvent::is_terminal) {
                return None;
            }
            let event = RolloutEvent {
                seq: events.len() as u64,
                attempt_id: self.attempt_id.clone(),
                deployment_id: self.deployment_id.clone(),
                event_type: draft.event_type,
                status: draft.status,
                slot: draft.slot,
                version: draft.version,
                traffic_percent: draft.traffic_percent,
                message: draft.message,
                error: draft.error,
                timestamp: now_ms(),
            };
            events.push(event.clone());
            event
        };
        self.appended.send_replace(event.seq as usize + 1);
        Some(event)
    }

    /// Events with `seq >= cursor`.
    pub fn since(&self, cursor: u64) -> Vec<RolloutEvent> {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .skip(cursor.min(events.len() as u64) as usize)
            .cloned()
            .collect()
    }

    pub fn get(&self, seq: u64) -> Option<RolloutEvent> {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        events.get(seq as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<RolloutEvent> {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        events.last().cloned()
    }

    /// A terminal event was appended.
    pub fn is_finished(&self) -> bool {
        self.last().is_some_and(|e| e.is_terminal())
    }

    /// Follow the log from its first event.
    pub fn stream(self: &Arc<Self>) -> EventStream {
        self.stream_from(0)
    }

    /// Follow the log from `cursor`.
    pub fn stream_from(self: &Arc<Self>, cursor: u64) -> EventStream {
        EventStream {
            log: Arc::clone(self),
            appended: self.appended.subscribe(),
            cursor,
            done: false,
        }
    }
}

/// Async pull iterator over an `EventLog`.
pub struct EventStream {
    log: Arc<EventLog>,
    appended: watch::Receiver<usize>,
    cursor: u64,
    done: bool,
}

impl EventStream {
    /// Next event, waiting for it if necessary. `None` after the terminal event.
    pub async fn next(&mut self) -> Option<RolloutEvent> {
        loop {
            if self.done {
                return None;
            }
            if let Some(event) = self.log.get(self.cursor) {
                self.cursor += 1;
                self.done = event.is_terminal();
                return Some(event);
            }
            if self.appended.changed().await.is_err() {
                // The log is gone; drain what is left.
                self.done = self.log.get(self.cursor).is_none();
            }
        }
    }

    /// Sequence number of the next event this stream will yield.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn attempt_id(&self) -> &str {
        self.log.attempt_id()
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
    use std::time::Duration;

    fn log() -> Arc<EventLog> {
        Arc::new(EventLog::new("a-1", "cart"))
    }

    #[test]
    fn append_assigns_sequence() {
        let log = log();
        let first = log
            .append(EventDraft::new(RolloutEventType::DeployStart, EventStatus::InProgress))
            .unwrap();
        let second = log
            .append(
                EventDraft::new(RolloutEventType::TrafficShift, EventStatus::Success)
                    .slot("green")
                    .traffic(30),
            )
            .unwrap();

        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(second.traffic_percent, Some(30));
        assert_eq!(log.since(1), vec![second]);
        assert!(log.since(9).is_empty());
    }

    #[test]
    fn log_is_sealed_after_terminal_event() {
        let log = log();
        log.append(EventDraft::new(RolloutEventType::Rollback, EventStatus::Failed));
        assert!(log.is_finished());
        assert!(log
            .append(EventDraft::new(RolloutEventType::TrafficShift, EventStatus::Success))
            .is_none());
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn stream_replays_then_follows_until_terminal() {
        let log = log();
        log.append(EventDraft::new(RolloutEventType::DeployStart, EventStatus::InProgress));
        let mut stream = log.stream();

        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(EventDraft::new(RolloutEventType::HealthCheck, EventStatus::Success));
            writer.append(EventDraft::new(RolloutEventType::DeployComplete, EventStatus::Success));
        });

        let mut types = Vec::new();
        while let Some(event) = stream.next().await {
            types.push(event.event_type);
        }
        assert_eq!(
            types,
            vec![
                RolloutEventType::DeployStart,
                RolloutEventType::HealthCheck,
                RolloutEventType::DeployComplete,
            ]
        );
        assert!(stream.next().await.is_none());
        assert_eq!(stream.cursor(), 3);
    }

    #[test]
    fn event_wire_format() {
        let log = log();
        let event = log
            .append(
                EventDraft::new(RolloutEventType::DeployComplete, EventStatus::Success)
                    .version("2.0.0"),
            )
            .unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "deploy_complete");
        assert_eq!(json["status"], "success");
        assert_eq!(json["version"], "2.0.0");
        assert!(json.get("slot").is_none());
    }
}
