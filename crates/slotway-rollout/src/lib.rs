//! slotway rollouts: moving live traffic from one plugin version to the next.
//!
//! # Components
//!
//! - **`strategy`**: `RolloutPlan`, strategies (immediate, blue-green,
//!   canary) and rollback ceilings
//! - **`events`**: per-attempt append-only `EventLog` and its `EventStream`
//! - **`controller`**: `RolloutController`, the phase machine
//!   `start → health_check ⇄ traffic_shift → complete | rollback | failure`
//! - **`manager`**: `RolloutManager`, one task per attempt, one running
//!   attempt per deployment, operator abort
//!
//! The controller reads health through the `HealthProbe` seam and request
//! metrics through `MetricsSource`, so both can be scripted in tests.

pub mod controller;
pub mod error;
pub mod events;
pub mod manager;
pub mod strategy;

pub use controller::{
    MetricsSource, RolloutController, RolloutOutcome, RolloutSettings, SLOT_LABELS, render_url,
};
pub use error::{RolloutError, RolloutResult};
pub use events::{EventDraft, EventLog, EventStatus, EventStream, RolloutEvent, RolloutEventType};
pub use manager::{
    AttemptState, AttemptSummary, DEFAULT_MAX_FINISHED, RolloutManager, RolloutPhase,
};
pub use strategy::{CanaryConfig, RollbackConfig, RolloutPlan, RolloutStrategy};
