//! redb table definitions for the cluster store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types).

use redb::TableDefinition;

/// Supervisor rows keyed by supervisor id.
pub const SUPERVISORS: TableDefinition<&str, &[u8]> = TableDefinition::new("supervisors");

/// Worker rows keyed by worker id.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Dedicated-client registrations keyed by channel login (no `#`).
pub const CHANNEL_CLIENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("channel_clients");
