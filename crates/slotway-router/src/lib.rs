//! slotway traffic router: resolves every request to a concrete slot.
//!
//! # Components
//!
//! - **`cache`**: `TtlCache`, the injectable short-TTL cache used for
//!   slot lists and sticky sessions
//! - **`registry`**: `SlotRegistry`, the slot access layer: cached reads,
//!   validated atomic writes, per-deployment cache invalidation
//! - **`router`**: `TrafficRouter`: header overrides, sticky sessions and
//!   weighted random selection
//!
//! ```text
//! route(deployment, ctx)
//!   ├── x-plugin-slot     → header-override
//!   ├── x-plugin-version  → version-header
//!   ├── x-plugin-beta     → beta-header (lowest non-zero weight)
//!   ├── session cache     → cache
//!   └── weighted draw     → weighted (cached against the session)
//! ```

pub mod cache;
pub mod error;
pub mod registry;
pub mod router;

pub use cache::{RouteCaches, TtlCache};
pub use error::{RouterError, RouterResult};
pub use registry::{SlotRegistry, validate_weights};
pub use router::{
    BETA_HEADER, RequestContext, RouteReason, RoutingDecision, SLOT_HEADER, SlotTraffic,
    TrafficRouter, VERSION_HEADER,
};
