//! Error types for rollouts.

use std::time::Duration;

use thiserror::Error;

use slotway_health::HealthError;
use slotway_router::RouterError;
use slotway_state::StateError;

/// Result type alias for rollout operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// One active rollout per deployment.
    #[error("deployment {deployment} already has rollout {attempt} in progress")]
    AlreadyInProgress { deployment: String, attempt: String },

    #[error("rollout attempt not found: {0}")]
    AttemptNotFound(String),

    #[error("invalid rollout plan: {0}")]
    InvalidPlan(String),

    #[error("deployment timed out after {}s", .0.as_secs())]
    DeploymentTimeout(Duration),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    State(#[from] StateError),
}
