//! StateStore: redb-backed state persistence for slotway.
//!
//! Provides typed operations over deployments, slots, and metric rollups.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(SLOTS).map_err(map_err!(Table))?;
        txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(deployment.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %deployment.id, "deployment stored");
        Ok(())
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: Deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(deployment);
        }
        Ok(results)
    }

    // ── Slots ──────────────────────────────────────────────────────

    /// Insert or update a single slot.
    pub fn put_slot(&self, slot: &Slot) -> StateResult<()> {
        self.put_slots(&slot.deployment_id, std::slice::from_ref(slot))
    }

    /// Write several slots of one deployment in a single transaction.
    ///
    /// Either every slot is written or none is.
    pub fn put_slots(&self, deployment_id: &str, slots: &[Slot]) -> StateResult<()> {
        let mut encoded = Vec::with_capacity(slots.len());
        for slot in slots {
            if slot.deployment_id != deployment_id {
                return Err(StateError::Write(format!(
                    "slot {} belongs to {}, not {deployment_id}",
                    slot.label, slot.deployment_id
                )));
            }
            let value = serde_json::to_vec(slot).map_err(map_err!(Serialize))?;
            encoded.push((slot.table_key(), value));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
            for (key, value) in &encoded {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %deployment_id, count = slots.len(), "slots stored");
        Ok(())
    }

    /// Get one slot of a deployment.
    pub fn get_slot(&self, deployment_id: &str, label: &str) -> StateResult<Option<Slot>> {
        let key = slot_key(deployment_id, label);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let slot: Slot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(slot))
            }
            None => Ok(None),
        }
    }

    /// List all slots of a deployment, ordered by label.
    pub fn list_slots(&self, deployment_id: &str) -> StateResult<Vec<Slot>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let slot: Slot =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if slot.deployment_id == deployment_id {
                    results.push(slot);
                }
            }
        }
        Ok(results)
    }

    /// Read, change and write a deployment's slots in one write transaction.
    ///
    /// `f` receives the committed slots keyed by label and may edit or add
    /// entries. Only entries that differ from what was read are written back.
    /// When `f` fails nothing is written. Returns the resulting slots ordered
    /// by label.
    pub fn modify_slots<E, F>(&self, deployment_id: &str, f: F) -> Result<Vec<Slot>, E>
    where
        E: From<StateError>,
        F: FnOnce(&mut BTreeMap<String, Slot>) -> Result<(), E>,
    {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (slots, written) = {
            let mut table = txn.open_table(SLOTS).map_err(map_err!(Table))?;

            let mut current = BTreeMap::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    let slot: Slot =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if slot.deployment_id == deployment_id {
                        current.insert(slot.label.clone(), slot);
                    }
                }
            }

            let mut slots = current.clone();
            // Dropping the uncommitted transaction discards it.
            f(&mut slots)?;

            let mut written = 0usize;
            for (label, slot) in &slots {
                if current.get(label) == Some(slot) {
                    continue;
                }
                if slot.deployment_id != deployment_id || &slot.label != label {
                    return Err(StateError::Write(format!(
                        "slot {}:{} filed under {deployment_id}:{label}",
                        slot.deployment_id, slot.label
                    ))
                    .into());
                }
                let value = serde_json::to_vec(slot).map_err(map_err!(Serialize))?;
                table
                    .insert(slot.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                written += 1;
            }
            (slots, written)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %deployment_id, written, "slots modified");
        Ok(slots.into_values().collect())
    }

    /// Set the health of one slot, leaving every other field as committed.
    ///
    /// Returns whether the stored health changed.
    pub fn set_slot_health(
        &self,
        deployment_id: &str,
        label: &str,
        health: HealthStatus,
        now: u64,
    ) -> StateResult<bool> {
        let mut changed = false;
        self.modify_slots(deployment_id, |slots| {
            let slot = slots
                .get_mut(label)
                .ok_or_else(|| StateError::NotFound(slot_key(deployment_id, label)))?;
            if slot.health != health {
                slot.health = health;
                slot.updated_at = now;
                changed = true;
            }
            Ok::<(), StateError>(())
        })?;
        Ok(changed)
    }

    /// Permanently delete a slot. Returns true if it existed.
    pub fn delete_slot(&self, deployment_id: &str, label: &str) -> StateResult<bool> {
        let key = slot_key(deployment_id, label);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SLOTS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "slot deleted");
        Ok(existed)
    }

    // ── Rollups ────────────────────────────────────────────────────

    /// Append a metric rollup. Rollups are never updated in place.
    pub fn put_rollup(&self, rollup: &MetricRollup) -> StateResult<()> {
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let key = rollup.table_key(&unique);
        let value = serde_json::to_vec(rollup).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List a deployment's rollups whose window closed in `[from_ms, to_ms]`,
    /// oldest first.
    pub fn list_rollups(
        &self,
        deployment_id: &str,
        from_ms: u64,
        to_ms: u64,
    ) -> StateResult<Vec<MetricRollup>> {
        if from_ms > to_ms {
            return Ok(Vec::new());
        }
        let lower = rollup_key_floor(deployment_id, from_ms);
        let upper = rollup_key_floor(deployment_id, to_ms.saturating_add(1));

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(lower.as_str()..upper.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollup: MetricRollup =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if rollup.deployment_id == deployment_id {
                results.push(rollup);
            }
        }
        Ok(results)
    }

    /// Delete every rollup whose window closed before `cutoff_ms`.
    /// Returns the number removed.
    pub fn delete_rollups_before(&self, cutoff_ms: u64) -> StateResult<usize> {
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let rollup: MetricRollup =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if rollup.window_end < cutoff_ms {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };
        if keys.is_empty() {
            return Ok(0);
        }
        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(removed = keys.len(), cutoff_ms, "rollups deleted");
        Ok(keys.len())
    }
}
