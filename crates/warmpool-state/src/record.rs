//! Typed view over a machine's metadata hash.

use std::collections::BTreeMap;

use warmpool_core::{TimestampError, parse_timestamp};

/// Field names of the `vm:{name}` hash.
pub mod field {
    pub const POOL: &str = "pool";
    pub const CLONE: &str = "clone";
    pub const CLONE_TIME: &str = "clone_time";
    pub const CHECK: &str = "check";
    pub const DESTROY: &str = "destroy";
    pub const LIFETIME: &str = "lifetime";
    pub const DISK: &str = "disk";
    pub const SNAPSHOT_PREFIX: &str = "snapshot:";
    pub const MIGRATION_TIME: &str = "migration_time";
    pub const CHECKOUT_TO_MIGRATION: &str = "checkout_to_migration";
}

/// Snapshot of a machine's persisted metadata.
///
/// Timestamps stay raw until read so that a malformed value only fails the
/// operation that needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    pub name: String,
    pub fields: BTreeMap<String, String>,
}

impl MachineRecord {
    pub fn new(name: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Owning pool.
    pub fn pool(&self) -> Option<&str> {
        self.get(field::POOL)
    }

    /// When the clone was requested.
    pub fn clone_started(&self) -> Result<Option<u64>, TimestampError> {
        self.timestamp(field::CLONE)
    }

    /// When the last passing health check ran.
    pub fn last_checked(&self) -> Result<Option<u64>, TimestampError> {
        self.timestamp(field::CHECK)
    }

    /// Per-machine lifetime override in hours.
    pub fn lifetime_hours(&self) -> Option<u64> {
        self.get(field::LIFETIME).and_then(|v| v.trim().parse().ok())
    }

    /// Extra disks in attach order, e.g. `["+10gb", "+20gb"]`.
    pub fn disks(&self) -> Vec<String> {
        self.get(field::DISK)
            .map(|raw| {
                raw.split(':')
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot name → creation timestamp.
    pub fn snapshots(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(field::SNAPSHOT_PREFIX)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect()
    }

    fn timestamp(&self, name: &str) -> Result<Option<u64>, TimestampError> {
        self.get(name).map(parse_timestamp).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> MachineRecord {
        MachineRecord::new(
            "poolvm-1",
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn timestamps_parse_lazily() {
        let rec = record(&[("clone", "1700000000"), ("check", "soon")]);
        assert_eq!(rec.clone_started(), Ok(Some(1_700_000_000)));
        assert!(rec.last_checked().is_err());
    }

    #[test]
    fn disks_and_snapshots() {
        let rec = record(&[
            ("disk", "+10gb:+20gb"),
            ("snapshot:base", "1700000000"),
            ("snapshot:after-install", "1700000100"),
            ("pool", "debian"),
        ]);
        assert_eq!(rec.disks(), vec!["+10gb", "+20gb"]);
        let snaps = rec.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps["base"], "1700000000");
        assert_eq!(rec.pool(), Some("debian"));
    }

    #[test]
    fn lifetime_override() {
        assert_eq!(record(&[("lifetime", "4")]).lifetime_hours(), Some(4));
        assert_eq!(record(&[("lifetime", "x")]).lifetime_hours(), None);
        assert_eq!(record(&[]).lifetime_hours(), None);
    }
}
