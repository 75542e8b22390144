//! slotway-health: health checking for plugin slots during a rollout.
//!
//! # Architecture
//!
//! ```text
//! HealthGate
//!   ├── HealthProbe (trait)  → ProbeResult per attempt
//!   │     └── HttpProbe      → GET {backend_url}{endpoint} over hyper
//!   └── HealthTracker        → consecutive successes / failures
//! ```
//!
//! A gate check passes after `success_threshold` consecutive successful
//! probes and fails after `unhealthy_threshold` consecutive failures.
//! Probes are spaced by the configured interval and each one is bounded
//! by the configured timeout.

pub mod checker;
pub mod error;
pub mod gate;

pub use checker::{parse_duration, HealthCheckConfig, HealthTracker, ProbeResult};
pub use error::{HealthError, HealthResult};
pub use gate::{HealthGate, HealthProbe, HttpProbe};
