//! Operator client for a running daemon: start a rollout and follow its
//! events by cursor polling.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use serde::de::DeserializeOwned;
use tracing::debug;

use slotway_api::rollout_handlers::{EventPage, StartedRollout};
use slotway_rollout::{RolloutEvent, RolloutEventType, RolloutPlan};

/// JSON envelope returned by every API endpoint.
#[derive(Debug, serde::Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Thin typed wrapper over the REST API.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    pub fn new(server: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            http,
            base: server.trim_end_matches('/').to_string(),
        })
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> anyhow::Result<T> {
        let status = resp.status();
        let envelope: Envelope<T> = resp
            .json()
            .await
            .with_context(|| format!("decode response ({status})"))?;
        if !envelope.success {
            bail!(
                "server returned {status}: {}",
                envelope.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        envelope
            .data
            .ok_or_else(|| anyhow!("server returned {status} without data"))
    }

    /// POST a rollout plan for `plan.deployment_id`.
    pub async fn start_rollout(&self, plan: &RolloutPlan) -> anyhow::Result<StartedRollout> {
        let url = format!("{}/api/v1/deployments/{}/rollouts", self.base, plan.deployment_id);
        let resp = self
            .http
            .post(&url)
            .json(plan)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        Self::decode(resp).await
    }

    /// Events of `attempt_id` from `cursor` on.
    pub async fn events(&self, attempt_id: &str, cursor: u64) -> anyhow::Result<EventPage> {
        let url = format!(
            "{}/api/v1/rollouts/{attempt_id}/events?cursor={cursor}",
            self.base
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        Self::decode(resp).await
    }

    /// Poll until the attempt emits its terminal event, calling `on_event`
    /// for every event in order. Returns the terminal event.
    pub async fn follow(
        &self,
        attempt_id: &str,
        poll: Duration,
        mut on_event: impl FnMut(&RolloutEvent),
    ) -> anyhow::Result<RolloutEvent> {
        let mut cursor = 0;
        loop {
            let page = self.events(attempt_id, cursor).await?;
            cursor = page.next_cursor;
            for event in &page.events {
                on_event(event);
                if event.is_terminal() {
                    return Ok(event.clone());
                }
            }
            if page.finished && page.events.is_empty() {
                bail!("rollout {attempt_id} finished but its terminal event was not returned");
            }
            debug!(attempt = %attempt_id, cursor, "waiting for rollout events");
            tokio::time::sleep(poll).await;
        }
    }
}

/// One human-readable line per event.
pub fn format_event(event: &RolloutEvent) -> String {
    let mut line = format!(
        "[{:>3}] {:<16} {:?}",
        event.seq,
        event.event_type.to_string(),
        event.status
    );
    if let Some(slot) = &event.slot {
        line.push_str(&format!(" slot={slot}"));
    }
    if let Some(version) = &event.version {
        line.push_str(&format!(" version={version}"));
    }
    if let Some(percent) = event.traffic_percent {
        line.push_str(&format!(" traffic={percent}%"));
    }
    if let Some(message) = &event.message {
        line.push_str(&format!(" {message}"));
    }
    if let Some(error) = &event.error {
        line.push_str(&format!(" error=\"{error}\""));
    }
    line
}

/// Error unless the rollout completed.
pub fn ensure_completed(terminal: &RolloutEvent) -> anyhow::Result<()> {
    match terminal.event_type {
        RolloutEventType::DeployComplete => Ok(()),
        other => bail!(
            "rollout {} ended with {other}: {}",
            terminal.attempt_id,
            terminal.error.as_deref().unwrap_or("no reason given")
        ),
    }
}
