//! redb table definitions for the slotway state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Slots keyed by `{deployment_id}:{slot_label}`.
pub const SLOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("slots");

/// Metric rollups keyed by `{deployment_id}:{window_end_ms:020}:{slot}:{id}`.
///
/// The zero-padded window end keeps keys of one deployment in time order,
/// so time-range queries are plain key-range scans.
pub const ROLLUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollups");
