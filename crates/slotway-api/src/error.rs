//! API error type and its mapping from domain errors to status codes.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use slotway_metrics::QueryError;
use slotway_rollout::RolloutError;
use slotway_router::RouterError;
use slotway_state::StateError;

use crate::handlers::ApiResponse;

/// An error rendered as `{"success": false, "error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() && self.status != StatusCode::SERVICE_UNAVAILABLE {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        (
            self.status,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(self.message),
            }),
        )
            .into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(_) => Self::not_found(e.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::NoActiveSlot(_) => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            RouterError::InvalidWeights(_) => Self::bad_request(e.to_string()),
            RouterError::SlotNotFound { .. } => Self::not_found(e.to_string()),
            RouterError::SlotActive { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            RouterError::State(inner) => inner.into(),
        }
    }
}

impl From<RolloutError> for ApiError {
    fn from(e: RolloutError) -> Self {
        match e {
            RolloutError::AlreadyInProgress { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            RolloutError::AttemptNotFound(_) => Self::not_found(e.to_string()),
            RolloutError::InvalidPlan(_) => Self::bad_request(e.to_string()),
            RolloutError::Router(inner) => inner.into(),
            RolloutError::State(inner) => inner.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(query) = e.downcast_ref::<QueryError>() {
            return Self::bad_request(query.to_string());
        }
        Self::internal(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_errors_map_to_statuses() {
        let cases = [
            (RouterError::NoActiveSlot("cart".into()), StatusCode::SERVICE_UNAVAILABLE),
            (RouterError::InvalidWeights("sum is 90".into()), StatusCode::BAD_REQUEST),
            (
                RouterError::SlotNotFound {
                    deployment: "cart".into(),
                    slot: "red".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                RouterError::SlotActive {
                    deployment: "cart".into(),
                    slot: "blue".into(),
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn rollout_errors_map_to_statuses() {
        let conflict = RolloutError::AlreadyInProgress {
            deployment: "cart".into(),
            attempt: "a-1".into(),
        };
        assert_eq!(ApiError::from(conflict).status, StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(RolloutError::InvalidPlan("no version".into())).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RolloutError::AttemptNotFound("a-9".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(RolloutError::Router(RouterError::NoActiveSlot("cart".into()))).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn query_errors_are_client_errors() {
        let err = ApiError::from(anyhow::Error::new(QueryError::ZeroBucket));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "bucket size must be at least one second");

        let err = ApiError::from(anyhow::anyhow!("disk full"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
