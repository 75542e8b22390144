//! Slot registry access layer.
//!
//! `SlotRegistry` is the only path through which slot state is read for
//! routing and written during rollouts. Reads go through a short-TTL slot
//! list cache; every write commits in one transaction and then invalidates
//! the slot list and sticky-session caches of that deployment only.
//!
//! A per-deployment generation counter guards the slot list cache: a load
//! that started before an invalidation is not allowed to repopulate the
//! cache with pre-write state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, info};

use slotway_state::{HealthStatus, Slot, SlotStatus, StateError, StateStore};

use crate::cache::{RouteCaches, SessionKey};
use crate::error::{RouterError, RouterResult};

/// Cached, invalidating access to the persisted slots of every deployment.
pub struct SlotRegistry {
    store: StateStore,
    caches: Arc<RouteCaches>,
    generations: DashMap<String, u64>,
}

impl SlotRegistry {
    /// Create a registry with default cache TTLs.
    pub fn new(store: StateStore) -> Self {
        Self::with_caches(store, Arc::new(RouteCaches::default()))
    }

    /// Create a registry around caller-provided caches.
    pub fn with_caches(store: StateStore, caches: Arc<RouteCaches>) -> Self {
        Self {
            store,
            caches,
            generations: DashMap::new(),
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Access the routing caches.
    pub fn caches(&self) -> &Arc<RouteCaches> {
        &self.caches
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Slots of a deployment ordered by label, served from cache when fresh.
    pub fn slots(&self, deployment_id: &str) -> RouterResult<Arc<Vec<Slot>>> {
        let key = deployment_id.to_string();
        if let Some(cached) = self.caches.slots.get(&key) {
            return Ok(cached);
        }

        let generation = self.generation(deployment_id);
        let slots = Arc::new(self.store.list_slots(deployment_id)?);
        if self.generation(deployment_id) == generation {
            self.caches.slots.insert(key, Arc::clone(&slots));
        }
        Ok(slots)
    }

    /// Slots of a deployment read straight from the store.
    pub fn slots_uncached(&self, deployment_id: &str) -> RouterResult<Vec<Slot>> {
        Ok(self.store.list_slots(deployment_id)?)
    }

    /// One slot, read straight from the store.
    pub fn slot(&self, deployment_id: &str, label: &str) -> RouterResult<Slot> {
        self.store
            .get_slot(deployment_id, label)?
            .ok_or_else(|| RouterError::SlotNotFound {
                deployment: deployment_id.to_string(),
                slot: label.to_string(),
            })
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Validate and atomically apply a new weight set.
    ///
    /// Slots not named in `weights` drop to 0. Validation runs against the
    /// slots read inside the same write transaction, and nothing is written
    /// when it fails.
    pub fn update_weights(
        &self,
        deployment_id: &str,
        weights: &BTreeMap<String, u32>,
    ) -> RouterResult<Vec<Slot>> {
        let now = now_ms();
        let updated = self.store.modify_slots(deployment_id, |slots| {
            let current: Vec<Slot> = slots.values().cloned().collect();
            validate_weights(deployment_id, &current, weights)?;
            for slot in slots.values_mut() {
                let weight = weights.get(&slot.label).copied().unwrap_or(0);
                if slot.weight != weight {
                    slot.weight = weight;
                    slot.updated_at = now;
                }
            }
            Ok::<(), RouterError>(())
        })?;
        self.invalidate(deployment_id);
        info!(deployment = %deployment_id, ?weights, "traffic weights updated");
        Ok(updated)
    }

    /// Atomically write a set of slots (new or changed) of one deployment.
    ///
    /// The merged result must keep the active weight sum at exactly 100, or
    /// leave the deployment with no active slot at all.
    pub fn apply_slots(&self, deployment_id: &str, changes: Vec<Slot>) -> RouterResult<()> {
        let count = changes.len();
        let now = now_ms();
        self.store.modify_slots(deployment_id, |slots| {
            for mut slot in changes {
                if slot.weight > 100 {
                    return Err(RouterError::InvalidWeights(format!(
                        "slot {} weight {} out of range",
                        slot.label, slot.weight
                    )));
                }
                slot.updated_at = now;
                slots.insert(slot.label.clone(), slot);
            }
            check_active_sum(slots.values())
        })?;
        self.invalidate(deployment_id);
        debug!(deployment = %deployment_id, count, "slots applied");
        Ok(())
    }

    /// Change the status of one slot, keeping its weight.
    pub fn set_status(
        &self,
        deployment_id: &str,
        label: &str,
        status: SlotStatus,
    ) -> RouterResult<()> {
        let now = now_ms();
        self.store.modify_slots(deployment_id, |slots| {
            let slot = slots.get_mut(label).ok_or_else(|| RouterError::SlotNotFound {
                deployment: deployment_id.to_string(),
                slot: label.to_string(),
            })?;
            if slot.status == status {
                return Ok(());
            }
            slot.status = status;
            slot.updated_at = now;
            check_active_sum(slots.values())
        })?;
        self.invalidate(deployment_id);
        debug!(deployment = %deployment_id, slot = %label, ?status, "slot status changed");
        Ok(())
    }

    /// Record the latest health-check result of one slot.
    ///
    /// Only the health field is written. Health does not affect routing, so
    /// no cache is invalidated.
    pub fn set_health(
        &self,
        deployment_id: &str,
        label: &str,
        health: HealthStatus,
    ) -> RouterResult<()> {
        self.store
            .set_slot_health(deployment_id, label, health, now_ms())
            .map_err(|e| match e {
                StateError::NotFound(_) => RouterError::SlotNotFound {
                    deployment: deployment_id.to_string(),
                    slot: label.to_string(),
                },
                other => RouterError::State(other),
            })?;
        Ok(())
    }

    /// Permanently remove a slot that is no longer active.
    pub fn remove_slot(&self, deployment_id: &str, label: &str) -> RouterResult<()> {
        let slot = self.slot(deployment_id, label)?;
        if slot.is_active() {
            return Err(RouterError::SlotActive {
                deployment: deployment_id.to_string(),
                slot: label.to_string(),
            });
        }
        self.store.delete_slot(deployment_id, label)?;
        self.invalidate(deployment_id);
        info!(deployment = %deployment_id, slot = %label, "slot removed");
        Ok(())
    }

    // ── Caches ─────────────────────────────────────────────────────

    /// Invalidate the slot list and sticky sessions of one deployment.
    pub fn invalidate(&self, deployment_id: &str) {
        *self
            .generations
            .entry(deployment_id.to_string())
            .or_insert(0) += 1;
        let sessions = self.caches.invalidate(deployment_id);
        debug!(deployment = %deployment_id, sessions, "route caches invalidated");
    }

    /// Drop every cached entry for every deployment.
    pub fn clear_caches(&self) {
        for mut generation in self.generations.iter_mut() {
            *generation += 1;
        }
        self.caches.clear();
    }

    /// Pin a sticky session to `label` unless the deployment was invalidated
    /// after `generation` was read. Returns whether the pin was kept.
    pub(crate) fn pin_session(&self, key: SessionKey, label: String, generation: u64) -> bool {
        if self.generation(&key.0) != generation {
            return false;
        }
        self.caches.sessions.insert(key.clone(), label);
        // An invalidation between the check and the insert has already run
        // its sweep, so the entry is removed here instead.
        if self.generation(&key.0) != generation {
            self.caches.sessions.remove(&key);
            return false;
        }
        true
    }

    pub(crate) fn generation(&self, deployment_id: &str) -> u64 {
        self.generations
            .get(deployment_id)
            .map(|g| *g)
            .unwrap_or(0)
    }
}

/// Check a proposed weight set against the current slots.
///
/// Every value must be within [0, 100], the values must sum to exactly 100,
/// every named slot must exist, and only active slots may carry traffic.
pub fn validate_weights(
    deployment_id: &str,
    slots: &[Slot],
    weights: &BTreeMap<String, u32>,
) -> RouterResult<()> {
    if weights.is_empty() {
        return Err(RouterError::InvalidWeights("no weights given".to_string()));
    }

    let mut sum: u64 = 0;
    for (label, &weight) in weights {
        if weight > 100 {
            return Err(RouterError::InvalidWeights(format!(
                "slot {label} weight {weight} out of range 0-100"
            )));
        }
        let slot = slots.iter().find(|s| &s.label == label).ok_or_else(|| {
            RouterError::InvalidWeights(format!(
                "slot {label} does not exist in deployment {deployment_id}"
            ))
        })?;
        if weight > 0 && !slot.is_active() {
            return Err(RouterError::InvalidWeights(format!(
                "slot {label} is not active and cannot take traffic"
            )));
        }
        sum += u64::from(weight);
    }

    if sum != 100 {
        return Err(RouterError::InvalidWeights(format!(
            "weights sum to {sum}, expected 100"
        )));
    }
    Ok(())
}

fn check_active_sum<'a>(slots: impl Iterator<Item = &'a Slot>) -> RouterResult<()> {
    let (active, sum) = slots
        .filter(|s| s.is_active())
        .fold((0usize, 0u64), |(n, sum), s| (n + 1, sum + u64::from(s.weight)));
    if active > 0 && sum != 100 {
        return Err(RouterError::InvalidWeights(format!(
            "active slots would carry {sum}% of traffic, expected 100"
        )));
    }
    Ok(())
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

    fn slot(label: &str, weight: u32, status: SlotStatus) -> Slot {
        Slot {
            deployment_id: "cart".to_string(),
            label: label.to_string(),
            status,
            weight,
            version: format!("v-{label}"),
            frontend_url: format!("/plugins/cart/{label}/"),
            backend_url: format!("http://cart-{label}:8080"),
            health: HealthStatus::Unknown,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn seeded() -> SlotRegistry {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_slots(
                "cart",
                &[
                    slot("blue", 100, SlotStatus::Active),
                    slot("green", 0, SlotStatus::Active),
                    slot("red", 0, SlotStatus::Inactive),
                ],
            )
            .unwrap();
        SlotRegistry::new(store)
    }

    fn weights(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(l, w)| (l.to_string(), *w)).collect()
    }

    fn active_sum(registry: &SlotRegistry) -> u32 {
        registry
            .slots_uncached("cart")
            .unwrap()
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.weight)
            .sum()
    }

    #[test]
    fn update_weights_keeps_sum_at_100() {
        let registry = seeded();
        for (b, g) in [(95, 5), (70, 30), (0, 100)] {
            registry
                .update_weights("cart", &weights(&[("blue", b), ("green", g)]))
                .unwrap();
            assert_eq!(active_sum(&registry), 100);
        }
    }

    #[test]
    fn rejects_sum_not_100_without_writing() {
        let registry = seeded();
        let err = registry
            .update_weights("cart", &weights(&[("blue", 60), ("green", 30)]))
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidWeights(_)));
        assert_eq!(registry.slot("cart", "blue").unwrap().weight, 100);
    }

    #[test]
    fn rejects_out_of_range_value() {
        let registry = seeded();
        let err = registry
            .update_weights("cart", &weights(&[("blue", 150), ("green", 0)]))
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidWeights(_)));
        assert_eq!(registry.slot("cart", "green").unwrap().weight, 0);
    }

    #[test]
    fn rejects_unknown_and_inactive_slots() {
        let registry = seeded();
        assert!(matches!(
            registry.update_weights("cart", &weights(&[("purple", 100)])),
            Err(RouterError::InvalidWeights(_))
        ));
        assert!(matches!(
            registry.update_weights("cart", &weights(&[("blue", 50), ("red", 50)])),
            Err(RouterError::InvalidWeights(_))
        ));
        assert!(matches!(
            registry.update_weights("cart", &BTreeMap::new()),
            Err(RouterError::InvalidWeights(_))
        ));
    }

    #[test]
    fn weight_update_invalidates_slot_cache() {
        let registry = seeded();
        assert_eq!(registry.slots("cart").unwrap()[0].weight, 100);

        registry
            .update_weights("cart", &weights(&[("blue", 40), ("green", 60)]))
            .unwrap();

        let slots = registry.slots("cart").unwrap();
        assert_eq!(slots[0].weight, 40);
        assert_eq!(slots[1].weight, 60);
    }

    #[test]
    fn weight_update_drops_sessions_of_that_deployment_only() {
        let registry = seeded();
        let sessions = &registry.caches().sessions;
        sessions.insert(("cart".to_string(), "s1".to_string()), "blue".to_string());
        sessions.insert(("search".to_string(), "s1".to_string()), "blue".to_string());

        registry
            .update_weights("cart", &weights(&[("blue", 50), ("green", 50)]))
            .unwrap();

        assert!(sessions.get(&("cart".to_string(), "s1".to_string())).is_none());
        assert!(sessions.get(&("search".to_string(), "s1".to_string())).is_some());
    }

    #[test]
    fn apply_slots_enforces_active_sum() {
        let registry = seeded();
        // Activating red at 10% without taking it from anyone breaks the sum.
        let err = registry
            .apply_slots("cart", vec![slot("red", 10, SlotStatus::Active)])
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidWeights(_)));

        registry
            .apply_slots(
                "cart",
                vec![
                    slot("blue", 90, SlotStatus::Active),
                    slot("red", 10, SlotStatus::Active),
                ],
            )
            .unwrap();
        assert_eq!(active_sum(&registry), 100);
    }

    #[test]
    fn apply_slots_allows_no_active_slot() {
        let store = StateStore::open_in_memory().unwrap();
        let registry = SlotRegistry::new(store);
        registry
            .apply_slots("cart", vec![slot("blue", 0, SlotStatus::Inactive)])
            .unwrap();
        assert_eq!(registry.slots("cart").unwrap().len(), 1);
    }

    #[test]
    fn remove_slot_refuses_active() {
        let registry = seeded();
        assert!(matches!(
            registry.remove_slot("cart", "blue"),
            Err(RouterError::SlotActive { .. })
        ));
        registry.remove_slot("cart", "red").unwrap();
        assert!(matches!(
            registry.slot("cart", "red"),
            Err(RouterError::SlotNotFound { .. })
        ));
    }

    #[test]
    fn set_health_is_persisted() {
        let registry = seeded();
        registry
            .set_health("cart", "green", HealthStatus::Healthy)
            .unwrap();
        assert_eq!(
            registry.slot("cart", "green").unwrap().health,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn set_health_leaves_weights_alone() {
        let registry = seeded();
        registry
            .update_weights("cart", &weights(&[("blue", 30), ("green", 70)]))
            .unwrap();
        registry
            .set_health("cart", "blue", HealthStatus::Unhealthy)
            .unwrap();

        let blue = registry.slot("cart", "blue").unwrap();
        assert_eq!(blue.health, HealthStatus::Unhealthy);
        assert_eq!(blue.weight, 30);
        assert_eq!(active_sum(&registry), 100);
        assert!(matches!(
            registry.set_health("cart", "purple", HealthStatus::Healthy),
            Err(RouterError::SlotNotFound { .. })
        ));
    }

    #[test]
    fn set_status_checks_sum_against_committed_weights() {
        let registry = seeded();
        registry
            .update_weights("cart", &weights(&[("blue", 40), ("green", 60)]))
            .unwrap();
        assert!(matches!(
            registry.set_status("cart", "green", SlotStatus::Inactive),
            Err(RouterError::InvalidWeights(_))
        ));
        assert_eq!(registry.slot("cart", "green").unwrap().status, SlotStatus::Active);
        registry
            .set_status("cart", "red", SlotStatus::Draining)
            .unwrap();
        assert_eq!(active_sum(&registry), 100);
    }

    #[test]
    fn concurrent_writers_keep_active_sum_at_100() {
        let registry = Arc::new(seeded());
        let rounds = 200u32;

        let weigher = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..rounds {
                    let blue = i % 101;
                    registry
                        .update_weights("cart", &weights(&[("blue", blue), ("green", 100 - blue)]))
                        .unwrap();
                }
            })
        };
        let checker = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..rounds {
                    let health = if i % 2 == 0 {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    };
                    registry.set_health("cart", "green", health).unwrap();
                    registry.set_health("cart", "blue", health).unwrap();
                    assert_eq!(active_sum(&registry), 100);
                }
            })
        };

        weigher.join().unwrap();
        checker.join().unwrap();

        assert_eq!(active_sum(&registry), 100);
        let last_blue = (rounds - 1) % 101;
        assert_eq!(registry.slot("cart", "blue").unwrap().weight, last_blue);
        assert_eq!(registry.slot("cart", "green").unwrap().weight, 100 - last_blue);
    }

    #[test]
    fn session_pin_from_before_invalidation_is_dropped() {
        let registry = seeded();
        let key = ("cart".to_string(), "sess-1".to_string());

        let generation = registry.generation("cart");
        registry.invalidate("cart");
        assert!(!registry.pin_session(key.clone(), "green".to_string(), generation));
        assert!(registry.caches().sessions.is_empty());

        let generation = registry.generation("cart");
        assert!(registry.pin_session(key.clone(), "green".to_string(), generation));
        assert_eq!(registry.caches().sessions.get(&key), Some("green".to_string()));
    }

    #[test]
    fn stale_load_does_not_repopulate_cache() {
        let registry = seeded();
        let before = registry.generation("cart");
        registry.invalidate("cart");
        assert_eq!(registry.generation("cart"), before + 1);

        registry.clear_caches();
        assert_eq!(registry.generation("cart"), before + 2);
        assert!(registry.caches().slots.is_empty());
    }
}
