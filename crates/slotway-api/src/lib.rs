//! slotway-api: REST API for slotway.
//!
//! Provides axum route handlers for traffic routing, slot weights, request
//! metrics and rollouts.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/deployments` | List all deployments |
//! | GET | `/api/v1/deployments/{id}/traffic` | Traffic distribution |
//! | PUT | `/api/v1/deployments/{id}/weights` | Update slot weights |
//! | GET | `/api/v1/deployments/{id}/route` | Resolve a request to a slot |
//! | GET | `/api/v1/deployments/{id}/backends` | Backend addresses in rotation |
//! | GET | `/api/v1/deployments/{id}/frontends` | Frontend addresses in rotation |
//! | DELETE | `/api/v1/deployments/{id}/slots/{slot}` | Remove a non-active slot |
//! | POST | `/api/v1/deployments/{id}/rollouts` | Start a rollout |
//! | GET | `/api/v1/deployments/{id}/metrics` | Recent metrics |
//! | GET | `/api/v1/deployments/{id}/metrics/timeseries` | Bucketed metrics |
//! | POST | `/api/v1/metrics/requests` | Ingest a request sample |
//! | POST | `/api/v1/metrics/resources` | Ingest a resource sample |
//! | GET | `/api/v1/rollouts` | List rollout attempts |
//! | GET | `/api/v1/rollouts/{attempt}` | Get one attempt |
//! | GET | `/api/v1/rollouts/{attempt}/events` | Poll events by cursor |
//! | GET | `/api/v1/rollouts/{attempt}/events/stream` | Server-sent events |
//! | POST | `/api/v1/rollouts/{attempt}/abort` | Abort a running attempt |
//! | GET | `/metrics` | Prometheus exposition |

pub mod error;
pub mod handlers;
pub mod rollout_handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};

use slotway_metrics::MetricsCollector;
use slotway_rollout::RolloutManager;
use slotway_router::TrafficRouter;

pub use error::ApiError;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: TrafficRouter,
    pub collector: Arc<MetricsCollector>,
    pub rollouts: Arc<RolloutManager>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/deployments", get(handlers::list_deployments))
        .route("/deployments/{id}/traffic", get(handlers::get_traffic))
        .route("/deployments/{id}/weights", put(handlers::update_weights))
        .route("/deployments/{id}/route", get(handlers::route_request))
        .route("/deployments/{id}/backends", get(handlers::list_backends))
        .route("/deployments/{id}/frontends", get(handlers::list_frontends))
        .route("/deployments/{id}/slots/{slot}", delete(handlers::delete_slot))
        .route("/deployments/{id}/rollouts", post(rollout_handlers::start_rollout))
        .route("/deployments/{id}/metrics", get(handlers::get_metrics))
        .route("/deployments/{id}/metrics/timeseries", get(handlers::get_time_series))
        .route("/metrics/requests", post(handlers::record_request))
        .route("/metrics/resources", post(handlers::record_resources))
        .route("/rollouts", get(rollout_handlers::list_rollouts))
        .route("/rollouts/{attempt}", get(rollout_handlers::get_rollout))
        .route("/rollouts/{attempt}/events", get(rollout_handlers::poll_events))
        .route("/rollouts/{attempt}/events/stream", get(rollout_handlers::stream_events))
        .route("/rollouts/{attempt}/abort", post(rollout_handlers::abort_rollout))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
