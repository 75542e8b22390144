//! Request routing: resolves a deployment request to one slot.
//!
//! Resolution precedence, first match wins:
//!
//! 1. `x-plugin-slot` naming an active slot
//! 2. `x-plugin-version` matching an active slot's version
//! 3. truthy `x-plugin-beta` → active slot with the lowest non-zero weight
//! 4. sticky session whose cached slot is still active
//! 5. weighted random draw over active slots in label order
//!
//! A header whose target does not resolve falls through to the next rule.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use slotway_state::{HealthStatus, Slot, SlotStatus};

use crate::error::{RouterError, RouterResult};
use crate::registry::SlotRegistry;

/// Header forcing a specific slot.
pub const SLOT_HEADER: &str = "x-plugin-slot";
/// Header forcing a specific version.
pub const VERSION_HEADER: &str = "x-plugin-version";
/// Header opting the request into the canary.
pub const BETA_HEADER: &str = "x-plugin-beta";

/// What the router needs to know about one request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    headers: HashMap<String, String>,
    session_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header. Names are matched case-insensitively.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.trim().to_string());
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// A non-empty header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|s| !s.is_empty())
    }
}

/// Which rule produced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteReason {
    HeaderOverride,
    VersionHeader,
    BetaHeader,
    Cache,
    Weighted,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HeaderOverride => "header-override",
            Self::VersionHeader => "version-header",
            Self::BetaHeader => "beta-header",
            Self::Cache => "cache",
            Self::Weighted => "weighted",
        };
        f.write_str(s)
    }
}

/// The per-request output of the router.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RoutingDecision {
    pub deployment_id: String,
    pub slot: String,
    pub version: String,
    pub backend_url: String,
    pub frontend_url: String,
    pub reason: RouteReason,
}

impl RoutingDecision {
    fn new(slot: &Slot, reason: RouteReason) -> Self {
        Self {
            deployment_id: slot.deployment_id.clone(),
            slot: slot.label.clone(),
            version: slot.version.clone(),
            backend_url: slot.backend_url.clone(),
            frontend_url: slot.frontend_url.clone(),
            reason,
        }
    }
}

/// One row of a deployment's traffic distribution.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SlotTraffic {
    pub slot: String,
    pub version: String,
    pub weight: u32,
    pub status: SlotStatus,
    pub health: HealthStatus,
}

/// Routes requests to deployment slots.
#[derive(Clone)]
pub struct TrafficRouter {
    registry: Arc<SlotRegistry>,
}

impl TrafficRouter {
    pub fn new(registry: Arc<SlotRegistry>) -> Self {
        Self { registry }
    }

    /// Access the slot registry.
    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    /// Resolve the serving slot for a request.
    pub fn route(&self, deployment_id: &str, ctx: &RequestContext) -> RouterResult<RoutingDecision> {
        self.route_with(deployment_id, ctx, || rand::thread_rng().gen_range(0..100))
    }

    /// Resolve with a caller-supplied draw in [0, 100) for the weighted rule.
    pub fn route_with(
        &self,
        deployment_id: &str,
        ctx: &RequestContext,
        draw: impl FnOnce() -> u32,
    ) -> RouterResult<RoutingDecision> {
        let generation = self.registry.generation(deployment_id);
        let slots = self.registry.slots(deployment_id)?;
        let active: Vec<&Slot> = slots.iter().filter(|s| s.is_active()).collect();
        if active.is_empty() {
            return Err(RouterError::NoActiveSlot(deployment_id.to_string()));
        }

        if let Some(label) = ctx.header(SLOT_HEADER) {
            if let Some(slot) = active.iter().find(|s| s.label == label) {
                return Ok(RoutingDecision::new(slot, RouteReason::HeaderOverride));
            }
            debug!(deployment = %deployment_id, slot = %label, "slot override does not match an active slot");
        }

        if let Some(version) = ctx.header(VERSION_HEADER) {
            if let Some(slot) = active.iter().find(|s| s.version == version) {
                return Ok(RoutingDecision::new(slot, RouteReason::VersionHeader));
            }
            debug!(deployment = %deployment_id, %version, "version override does not match an active slot");
        }

        if ctx.header(BETA_HEADER).is_some_and(is_truthy) {
            if let Some(slot) = canary_slot(&active) {
                return Ok(RoutingDecision::new(slot, RouteReason::BetaHeader));
            }
        }

        let session_key = ctx
            .session_id()
            .map(|sid| (deployment_id.to_string(), sid.to_string()));

        if let Some(key) = &session_key {
            let sessions = &self.registry.caches().sessions;
            if let Some(label) = sessions.get(key) {
                if let Some(slot) = active.iter().find(|s| s.label == label) {
                    return Ok(RoutingDecision::new(slot, RouteReason::Cache));
                }
                sessions.remove(key);
            }
        }

        let slot = match pick_weighted(&active, draw()) {
            Some(slot) => slot,
            None => {
                // Active weights should always sum to 100; serve rather than fail.
                warn!(deployment = %deployment_id, "active weights do not cover the draw");
                active[0]
            }
        };

        if let Some(key) = session_key {
            if !self.registry.pin_session(key, slot.label.clone(), generation) {
                debug!(deployment = %deployment_id, "slots changed while routing, session not pinned");
            }
        }
        Ok(RoutingDecision::new(slot, RouteReason::Weighted))
    }

    /// Weight, version and status of every slot of a deployment.
    pub fn traffic_distribution(&self, deployment_id: &str) -> RouterResult<Vec<SlotTraffic>> {
        let slots = self.registry.slots_uncached(deployment_id)?;
        Ok(slots
            .into_iter()
            .map(|s| SlotTraffic {
                slot: s.label,
                version: s.version,
                weight: s.weight,
                status: s.status,
                health: s.health,
            })
            .collect())
    }

    /// Validate, persist and publish a new weight set.
    pub fn update_weights(
        &self,
        deployment_id: &str,
        weights: &BTreeMap<String, u32>,
    ) -> RouterResult<Vec<Slot>> {
        self.registry.update_weights(deployment_id, weights)
    }

    /// Backend addresses of the slots currently receiving traffic.
    pub fn backend_urls(&self, deployment_id: &str) -> RouterResult<Vec<String>> {
        Ok(self
            .serving_slots(deployment_id)?
            .into_iter()
            .map(|s| s.backend_url)
            .collect())
    }

    /// Frontend addresses of the slots currently receiving traffic.
    pub fn frontend_urls(&self, deployment_id: &str) -> RouterResult<Vec<String>> {
        Ok(self
            .serving_slots(deployment_id)?
            .into_iter()
            .map(|s| s.frontend_url)
            .collect())
    }

    fn serving_slots(&self, deployment_id: &str) -> RouterResult<Vec<Slot>> {
        let slots = self.registry.slots(deployment_id)?;
        Ok(slots
            .iter()
            .filter(|s| s.is_active() && s.weight > 0)
            .cloned()
            .collect())
    }
}

/// Walk active slots accumulating weights; the slot whose cumulative range
/// contains `draw` wins.
fn pick_weighted<'a>(active: &[&'a Slot], draw: u32) -> Option<&'a Slot> {
    let mut cumulative = 0u32;
    for slot in active {
        cumulative += slot.weight;
        if draw < cumulative {
            return Some(slot);
        }
    }
    None
}

/// The active slot with the lowest non-zero weight (first in label order on ties).
fn canary_slot<'a>(active: &[&'a Slot]) -> Option<&'a Slot> {
    active
        .iter()
        .filter(|s| s.weight > 0)
        .min_by_key(|s| s.weight)
        .copied()
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
