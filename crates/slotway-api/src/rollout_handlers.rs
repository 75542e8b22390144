//! REST API handlers for rollout management.
//!
//! Provides endpoints to start, list, inspect, follow and abort rollouts.
//! Events are available both by cursor polling and as a server-sent event
//! feed that closes after the terminal event.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use futures::stream;
use tracing::{info, warn};

use slotway_rollout::{AttemptSummary, RolloutEvent, RolloutPhase, RolloutPlan};

use crate::AppState;
use crate::error::ApiError;
use crate::handlers::{ApiResponse, ApiResult};

/// Response to a started rollout.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct StartedRollout {
    pub attempt_id: String,
    pub deployment_id: String,
    /// Path for polling the attempt's events.
    pub events: String,
}

/// POST /api/v1/deployments/:id/rollouts
///
/// The body is a `RolloutPlan`; its deployment id comes from the path.
pub async fn start_rollout(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut plan): Json<RolloutPlan>,
) -> Result<impl IntoResponse, ApiError> {
    plan.deployment_id = id.clone();
    let (attempt_id, _stream) = state.rollouts.start(plan).await?;
    info!(deployment = %id, attempt = %attempt_id, "rollout started via API");

    let started = StartedRollout {
        events: format!("/api/v1/rollouts/{attempt_id}/events"),
        attempt_id,
        deployment_id: id,
    };
    Ok((StatusCode::CREATED, ApiResponse::ok(started)))
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<AppState>) -> ApiResult<Vec<AttemptSummary>> {
    Ok(ApiResponse::ok(state.rollouts.list().await))
}

/// GET /api/v1/rollouts/:attempt
pub async fn get_rollout(
    State(state): State<AppState>,
    Path(attempt): Path<String>,
) -> ApiResult<AttemptSummary> {
    Ok(ApiResponse::ok(state.rollouts.get(&attempt).await?))
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct CursorQuery {
    #[serde(default)]
    pub cursor: u64,
}

/// One page of an attempt's events.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct EventPage {
    pub events: Vec<RolloutEvent>,
    /// Cursor for the next poll.
    pub next_cursor: u64,
    /// The attempt reached a terminal event; nothing more will follow.
    pub finished: bool,
}

/// GET /api/v1/rollouts/:attempt/events?cursor=
pub async fn poll_events(
    State(state): State<AppState>,
    Path(attempt): Path<String>,
    Query(q): Query<CursorQuery>,
) -> ApiResult<EventPage> {
    let events = state.rollouts.events(&attempt, q.cursor).await?;
    let summary = state.rollouts.get(&attempt).await?;
    let finished = matches!(
        summary.phase,
        RolloutPhase::Complete | RolloutPhase::Rollback | RolloutPhase::Failure
    );
    Ok(ApiResponse::ok(EventPage {
        next_cursor: q.cursor + events.len() as u64,
        events,
        finished,
    }))
}

/// GET /api/v1/rollouts/:attempt/events/stream?cursor=
///
/// Each event is sent with its type as the SSE event name and its sequence
/// number as the id. The feed ends after the terminal event.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(attempt): Path<String>,
    Query(q): Query<CursorQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.rollouts.stream(&attempt, q.cursor).await?;

    let feed = stream::unfold(events, |mut events| async move {
        let event = events.next().await?;
        let sse = match Event::default()
            .event(event.event_type.to_string())
            .id(event.seq.to_string())
            .json_data(&event)
        {
            Ok(sse) => sse,
            Err(e) => {
                warn!(attempt = %event.attempt_id, seq = event.seq, error = %e, "event not serializable");
                Event::default().event("error").data(e.to_string())
            }
        };
        Some((Ok(sse), events))
    });

    Ok(Sse::new(feed).keep_alive(KeepAlive::default()))
}

/// POST /api/v1/rollouts/:attempt/abort
pub async fn abort_rollout(
    State(state): State<AppState>,
    Path(attempt): Path<String>,
) -> ApiResult<serde_json::Value> {
    let aborted = state.rollouts.abort(&attempt).await?;
    if !aborted {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("rollout {attempt} already finished"),
        ));
    }
    Ok(ApiResponse::ok(serde_json::json!({
        "attempt_id": attempt,
        "status": "aborting"
    })))
}
