//! redb table definitions for the embedded metadata store.
//!
//! Metadata tables use `u64` keys and `&[u8]` values (JSON-serialized
//! domain types), so range scans walk records in ID order.

use redb::TableDefinition;

/// Containers keyed by container ID.
pub const CONTAINERS: TableDefinition<u64, &[u8]> = TableDefinition::new("containers");

/// Resources keyed by resource ID.
pub const RESOURCES: TableDefinition<u64, &[u8]> = TableDefinition::new("resources");

/// Counters keyed by name (`alloc_id`).
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Key of the ID allocation counter in [`COUNTERS`].
pub const ALLOC_ID_KEY: &str = "alloc_id";
