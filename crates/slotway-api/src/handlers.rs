//! REST API handlers for routing, weights and metrics.
//!
//! Each handler goes through the `TrafficRouter` or the `MetricsCollector`
//! and returns the JSON envelope.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use tracing::{debug, info, warn};

use slotway_metrics::{
    AggregatedMetrics, MetricSample, ResourceSample, TimeRange, TimeSeriesPoint,
};
use slotway_router::{RequestContext, RoutingDecision, SlotTraffic};
use slotway_state::{Deployment, MetricRollup};

use crate::AppState;
use crate::error::ApiError;

/// Header carrying the caller's session for sticky routing.
pub const SESSION_HEADER: &str = "x-session-id";

/// Window of `/metrics` and of the metrics endpoint when `minutes` is absent.
const DEFAULT_METRICS_MINUTES: u64 = 5;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    pub(crate) success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ── Deployments ────────────────────────────────────────────────

/// A deployment with its current slots.
#[derive(serde::Serialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub slots: Vec<SlotTraffic>,
}

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<AppState>) -> ApiResult<Vec<DeploymentView>> {
    let deployments = state.router.registry().store().list_deployments()?;
    let mut views = Vec::with_capacity(deployments.len());
    for deployment in deployments {
        let slots = state.router.traffic_distribution(&deployment.id)?;
        views.push(DeploymentView { deployment, slots });
    }
    Ok(ApiResponse::ok(views))
}

// ── Traffic ────────────────────────────────────────────────────

/// GET /api/v1/deployments/:id/traffic
pub async fn get_traffic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<SlotTraffic>> {
    Ok(ApiResponse::ok(state.router.traffic_distribution(&id)?))
}

/// Weight update request body.
#[derive(serde::Deserialize)]
pub struct WeightsRequest {
    pub weights: BTreeMap<String, u32>,
}

/// PUT /api/v1/deployments/:id/weights
pub async fn update_weights(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WeightsRequest>,
) -> ApiResult<Vec<SlotTraffic>> {
    state.router.update_weights(&id, &req.weights)?;
    info!(deployment = %id, weights = ?req.weights, "weights updated via API");
    Ok(ApiResponse::ok(state.router.traffic_distribution(&id)?))
}

/// GET /api/v1/deployments/:id/route
///
/// Resolves using the routing headers and `x-session-id` of this request.
pub async fn route_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<RoutingDecision> {
    let ctx = request_context(&headers);
    let decision = state.router.route(&id, &ctx)?;
    debug!(deployment = %id, slot = %decision.slot, reason = %decision.reason, "request routed");
    Ok(ApiResponse::ok(decision))
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    let mut ctx = RequestContext::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            ctx = ctx.with_header(name.as_str(), value);
        }
    }
    if let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        ctx = ctx.with_session(session);
    }
    ctx
}

/// GET /api/v1/deployments/:id/backends
pub async fn list_backends(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<String>> {
    Ok(ApiResponse::ok(state.router.backend_urls(&id)?))
}

/// GET /api/v1/deployments/:id/frontends
pub async fn list_frontends(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<String>> {
    Ok(ApiResponse::ok(state.router.frontend_urls(&id)?))
}

/// DELETE /api/v1/deployments/:id/slots/:slot
pub async fn delete_slot(
    State(state): State<AppState>,
    Path((id, slot)): Path<(String, String)>,
) -> ApiResult<&'static str> {
    state.router.registry().remove_slot(&id, &slot)?;
    Ok(ApiResponse::ok("deleted"))
}

// ── Metrics ────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
pub struct MetricsQuery {
    pub minutes: Option<u64>,
    /// Restrict to one slot.
    pub slot: Option<String>,
}

/// GET /api/v1/deployments/:id/metrics
pub async fn get_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<MetricsQuery>,
) -> ApiResult<AggregatedMetrics> {
    let minutes = q.minutes.unwrap_or(DEFAULT_METRICS_MINUTES);
    let metrics = match q.slot {
        Some(slot) => {
            state
                .collector
                .get_slot_metrics(&id, &slot, TimeRange::last_minutes(minutes))
                .await?
        }
        None => state.collector.get_recent_metrics(&id, minutes).await?,
    };
    Ok(ApiResponse::ok(metrics))
}

#[derive(Debug, serde::Deserialize)]
pub struct TimeSeriesQuery {
    /// Unix milliseconds. Defaults to one hour before `to`.
    pub from: Option<u64>,
    /// Unix milliseconds. Defaults to now.
    pub to: Option<u64>,
    /// Bucket width in seconds. Defaults to 60.
    pub bucket: Option<u64>,
}

/// GET /api/v1/deployments/:id/metrics/timeseries
pub async fn get_time_series(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TimeSeriesQuery>,
) -> ApiResult<Vec<TimeSeriesPoint>> {
    let to = q.to.unwrap_or_else(now_ms);
    let from = q.from.unwrap_or(to.saturating_sub(60 * 60 * 1000));
    let bucket = q.bucket.unwrap_or(60);

    let points = state
        .collector
        .get_time_series(&id, TimeRange::new(from, to), bucket)
        .await?;
    Ok(ApiResponse::ok(points))
}

/// POST /api/v1/metrics/requests
pub async fn record_request(
    State(state): State<AppState>,
    Json(sample): Json<MetricSample>,
) -> Result<impl IntoResponse, ApiError> {
    if sample.deployment_id.trim().is_empty() {
        return Err(ApiError::bad_request("deployment_id is required"));
    }
    if !sample.latency_ms.is_finite() || sample.latency_ms < 0.0 {
        return Err(ApiError::bad_request("latency_ms must be a non-negative number"));
    }
    state.collector.record_request(sample);
    Ok((StatusCode::ACCEPTED, ApiResponse::ok("recorded")))
}

/// POST /api/v1/metrics/resources
pub async fn record_resources(
    State(state): State<AppState>,
    Json(sample): Json<ResourceSample>,
) -> Result<impl IntoResponse, ApiError> {
    if sample.deployment_id.trim().is_empty() {
        return Err(ApiError::bad_request("deployment_id is required"));
    }
    let rollup: MetricRollup = state.collector.record_resource_usage(sample)?;
    Ok((StatusCode::CREATED, ApiResponse::ok(rollup)))
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
///
/// Fails with 500 when the deployment list cannot be read. A deployment or
/// slot whose metrics cannot be read is logged and left out of the scrape.
pub async fn prometheus_metrics(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.router.registry().store();
    let deployments = store.list_deployments()?;
    let range = TimeRange::last_minutes(DEFAULT_METRICS_MINUTES);
    let mut snapshots = Vec::new();

    for d in &deployments {
        match state.collector.get_metrics(&d.id, range).await {
            Ok(metrics) => snapshots.push(metrics),
            Err(e) => warn!(
                deployment = %d.id,
                error = %format!("{e:#}"),
                "deployment metrics unavailable for scrape"
            ),
        }
        let slots = match store.list_slots(&d.id) {
            Ok(slots) => slots,
            Err(e) => {
                warn!(deployment = %d.id, error = %e, "slot list unavailable for scrape");
                continue;
            }
        };
        for slot in slots {
            match state.collector.get_slot_metrics(&d.id, &slot.label, range).await {
                Ok(metrics) => snapshots.push(metrics),
                Err(e) => warn!(
                    deployment = %d.id,
                    slot = %slot.label,
                    error = %format!("{e:#}"),
                    "slot metrics unavailable for scrape"
                ),
            }
        }
    }

    let body = slotway_metrics::render_prometheus(&snapshots);
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
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
    use crate::test_support::{seeded_state, test_state};
    use axum::body::to_bytes;
    use axum::http::HeaderValue;
    use axum::response::Response;
    use std::sync::Arc;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn list_deployments_empty() {
        let state = test_state();
        let resp = list_deployments(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn list_deployments_includes_slots() {
        let state = seeded_state();
        let resp = list_deployments(State(state)).await.into_response();
        let json = body_json(resp).await;
        assert_eq!(json["data"][0]["id"], "cart");
        assert_eq!(json["data"][0]["slots"][0]["slot"], "blue");
        assert_eq!(json["data"][0]["slots"][0]["weight"], 90);
    }

    #[tokio::test]
    async fn update_weights_rejects_bad_sum() {
        let state = seeded_state();
        let req = WeightsRequest {
            weights: BTreeMap::from([("blue".to_string(), 50), ("green".to_string(), 40)]),
        };
        let resp = update_weights(State(state.clone()), Path("cart".to_string()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Nothing was written.
        let traffic = state.router.traffic_distribution("cart").unwrap();
        assert_eq!(traffic[0].weight, 90);
    }

    #[tokio::test]
    async fn update_weights_applies() {
        let state = seeded_state();
        let req = WeightsRequest {
            weights: BTreeMap::from([("blue".to_string(), 50), ("green".to_string(), 50)]),
        };
        let resp = update_weights(State(state), Path("cart".to_string()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"][0]["weight"], 50);
        assert_eq!(json["data"][1]["weight"], 50);
    }

    #[tokio::test]
    async fn route_honors_slot_header() {
        let state = seeded_state();
        let mut headers = HeaderMap::new();
        headers.insert("x-plugin-slot", HeaderValue::from_static("green"));
        let resp = route_request(State(state), Path("cart".to_string()), headers)
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["slot"], "green");
        assert_eq!(json["data"]["reason"], "header-override");
    }

    #[tokio::test]
    async fn route_is_sticky_per_session() {
        let state = seeded_state();
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("s-42"));

        let first = route_request(State(state.clone()), Path("cart".to_string()), headers.clone())
            .await
            .into_response();
        let first = body_json(first).await;
        let second = route_request(State(state), Path("cart".to_string()), headers)
            .await
            .into_response();
        let second = body_json(second).await;

        assert_eq!(first["data"]["slot"], second["data"]["slot"]);
        assert_eq!(second["data"]["reason"], "cache");
    }

    #[tokio::test]
    async fn route_unknown_deployment_is_unavailable() {
        let state = test_state();
        let resp = route_request(State(state), Path("nope".to_string()), HeaderMap::new())
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("no active slot"));
    }

    #[tokio::test]
    async fn delete_active_slot_conflicts() {
        let state = seeded_state();
        let resp = delete_slot(State(state.clone()), Path(("cart".to_string(), "blue".to_string())))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = delete_slot(State(state), Path(("cart".to_string(), "red".to_string())))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recorded_requests_show_up_after_flush() {
        let state = seeded_state();
        for status in [200u16, 200, 500, 200] {
            let sample = MetricSample::new("cart", Some("blue"), status, 12.0);
            let resp = record_request(State(state.clone()), Json(sample))
                .await
                .into_response();
            assert_eq!(resp.status(), StatusCode::ACCEPTED);
        }
        state.collector.flush().await.unwrap();

        let resp = get_metrics(
            State(state),
            Path("cart".to_string()),
            Query(MetricsQuery {
                minutes: Some(5),
                slot: None,
            }),
        )
        .await
        .into_response();
        let json = body_json(resp).await;
        assert_eq!(json["data"]["request_count"], 4);
        assert_eq!(json["data"]["error_count"], 1);
    }

    #[tokio::test]
    async fn record_request_requires_deployment() {
        let state = test_state();
        let sample = MetricSample::new("", None, 200, 1.0);
        let resp = record_request(State(state), Json(sample)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn time_series_validates_query() {
        let state = test_state();
        let bad = [
            (Some(0), Some(1000), Some(0)),
            (Some(5000), Some(1000), Some(60)),
            (Some(0), Some(100_000_000), Some(1)),
        ];
        for (from, to, bucket) in bad {
            let resp = get_time_series(
                State(state.clone()),
                Path("cart".to_string()),
                Query(TimeSeriesQuery { from, to, bucket }),
            )
            .await
            .into_response();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }

        let resp = get_time_series(
            State(state),
            Path("cart".to_string()),
            Query(TimeSeriesQuery {
                from: Some(0),
                to: Some(120_000),
                bucket: Some(60),
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = seeded_state();
        state
            .collector
            .record_request(MetricSample::new("cart", Some("blue"), 200, 5.0));
        state.collector.flush().await.unwrap();

        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("slotway_requests{deployment=\"cart\"} 1"));
        assert!(text.contains("slotway_requests{deployment=\"cart\",slot=\"blue\"} 1"));
    }

    struct UnreadableRollups;

    impl slotway_metrics::RollupStore for UnreadableRollups {
        fn put_rollup(&self, _rollup: &MetricRollup) -> anyhow::Result<()> {
            Ok(())
        }

        fn list_rollups(
            &self,
            _deployment_id: &str,
            _from_ms: u64,
            _to_ms: u64,
        ) -> anyhow::Result<Vec<MetricRollup>> {
            anyhow::bail!("rollups table unreadable")
        }

        fn delete_rollups_before(&self, _cutoff_ms: u64) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn prometheus_skips_deployments_whose_metrics_fail() {
        let mut state = seeded_state();
        state.collector = Arc::new(slotway_metrics::MetricsCollector::with_store(
            Arc::new(UnreadableRollups),
            std::time::Duration::from_secs(10),
        ));

        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains("deployment=\"cart\""));
    }
}
