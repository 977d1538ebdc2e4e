//! redb table definitions for the inventory store.
//!
//! Sets and hashes are flattened into `&str` keys of the form
//! `{name}\x1f{member}` so a prefix range scan yields one logical key.

use redb::TableDefinition;

/// Set members keyed by `{set}\x1f{member}`.
pub const SETS: TableDefinition<&str, ()> = TableDefinition::new("sets");

/// Hash fields keyed by `{key}\x1f{field}`.
pub const HASHES: TableDefinition<&str, &str> = TableDefinition::new("hashes");

/// Plain string values (flags, guards) keyed by name.
pub const VALUES: TableDefinition<&str, &str> = TableDefinition::new("values");

/// Integer counters keyed by name.
pub const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("counters");

/// Expiry deadlines (unix seconds) keyed by logical key name.
pub const EXPIRY: TableDefinition<&str, u64> = TableDefinition::new("expiry");
