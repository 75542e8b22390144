//! Error types for routing and slot registry access.

use thiserror::Error;

use slotway_state::StateError;

/// Result type alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Errors surfaced by the router and the slot registry.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Nothing safe to route to. Fatal for the request.
    #[error("no active slot for deployment {0}")]
    NoActiveSlot(String),

    /// Rejected before any write; the caller can correct the input.
    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    #[error("slot not found: {deployment}/{slot}")]
    SlotNotFound { deployment: String, slot: String },

    /// Active slots cannot be removed.
    #[error("slot {deployment}/{slot} is still active")]
    SlotActive { deployment: String, slot: String },

    #[error(transparent)]
    State(#[from] StateError),
}
