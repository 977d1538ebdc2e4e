//! InventoryStore — redb-backed shared state for the pool manager.
//!
//! Exposes set, hash, value and counter primitives over a handful of flat
//! tables. Every public method is one transaction; compound operations such
//! as [`InventoryStore::smove`] or [`InventoryStore::sadd_bounded`] are
//! therefore atomic with respect to every other caller of the same store.
//!
//! Key expiry is lazy: reads of hashes and values treat an expired key as
//! absent, writes purge it before touching it, and
//! [`InventoryStore::purge_expired`] sweeps whatever is left.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, Value,
    WriteTransaction,
};
use tracing::debug;
use warmpool_core::epoch_secs;

use crate::error::{StateError, StateResult};
use crate::keys;
use crate::record::MachineRecord;
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const SEP: char = '\u{1f}';

fn composite(key: &str, field: &str) -> String {
    format!("{key}{SEP}{field}")
}

fn prefix_of(key: &str) -> String {
    format!("{key}{SEP}")
}

/// Thread-safe inventory store backed by redb.
#[derive(Clone)]
pub struct InventoryStore {
    db: Arc<Database>,
}

impl InventoryStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "inventory store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory inventory store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        self.write(|txn| {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(SETS).map_err(map_err!(Table))?;
            txn.open_table(HASHES).map_err(map_err!(Table))?;
            txn.open_table(VALUES).map_err(map_err!(Table))?;
            txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            txn.open_table(EXPIRY).map_err(map_err!(Table))?;
            Ok(())
        })
    }

    /// Run `f` in a write transaction, committing only if it succeeds.
    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<T>) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(map_err!(Commit))?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> StateResult<T>) -> StateResult<T> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&txn)
    }

    // ── Sets ───────────────────────────────────────────────────────

    /// Add `member` to `set`. Returns true if it was not already present.
    pub fn sadd(&self, set: &str, member: &str) -> StateResult<bool> {
        let key = composite(set, member);
        self.write(|txn| {
            let mut table = txn.open_table(SETS).map_err(map_err!(Table))?;
            let previous = table.insert(key.as_str(), ()).map_err(map_err!(Write))?;
            Ok(previous.is_none())
        })
    }

    /// Remove `member` from `set`. Returns true if it was present.
    pub fn srem(&self, set: &str, member: &str) -> StateResult<bool> {
        let key = composite(set, member);
        self.write(|txn| {
            let mut table = txn.open_table(SETS).map_err(map_err!(Table))?;
            let removed = table.remove(key.as_str()).map_err(map_err!(Write))?;
            Ok(removed.is_some())
        })
    }

    /// Move `member` from `from` to `to` if it is a member of `from`.
    ///
    /// Returns false, touching nothing, when `member` is not in `from`.
    pub fn smove(&self, from: &str, to: &str, member: &str) -> StateResult<bool> {
        let source = composite(from, member);
        let target = composite(to, member);
        let moved = self.write(|txn| {
            let mut table = txn.open_table(SETS).map_err(map_err!(Table))?;
            let present = table
                .remove(source.as_str())
                .map_err(map_err!(Write))?
                .is_some();
            if present {
                table.insert(target.as_str(), ()).map_err(map_err!(Write))?;
            }
            Ok(present)
        })?;
        debug!(%member, %from, %to, moved, "smove");
        Ok(moved)
    }

    pub fn sismember(&self, set: &str, member: &str) -> StateResult<bool> {
        let key = composite(set, member);
        self.read(|txn| {
            let table = txn.open_table(SETS).map_err(map_err!(Table))?;
            let found = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            Ok(found)
        })
    }

    /// All members of `set` in lexicographic order.
    pub fn smembers(&self, set: &str) -> StateResult<Vec<String>> {
        let prefix = prefix_of(set);
        self.read(|txn| {
            let table = txn.open_table(SETS).map_err(map_err!(Table))?;
            let mut members = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                match key.value().strip_prefix(prefix.as_str()) {
                    Some(member) => members.push(member.to_string()),
                    None => break,
                }
            }
            Ok(members)
        })
    }

    pub fn scard(&self, set: &str) -> StateResult<usize> {
        Ok(self.smembers(set)?.len())
    }

    /// Remove and return one member of `set` (the lexicographically first).
    pub fn spop(&self, set: &str) -> StateResult<Option<String>> {
        let prefix = prefix_of(set);
        self.write(|txn| {
            let mut table = txn.open_table(SETS).map_err(map_err!(Table))?;
            let first = {
                let mut range = table.range(prefix.as_str()..).map_err(map_err!(Read))?;
                match range.next() {
                    Some(entry) => {
                        let (key, _) = entry.map_err(map_err!(Read))?;
                        let key = key.value().to_string();
                        key.starts_with(prefix.as_str()).then_some(key)
                    }
                    None => None,
                }
            };
            let Some(key) = first else {
                return Ok(None);
            };
            table.remove(key.as_str()).map_err(map_err!(Write))?;
            Ok(Some(key[prefix.len()..].to_string()))
        })
    }

    /// Add `member` to `set` only if the set holds fewer than `limit` members.
    ///
    /// Returns false when the member is already present or the set is full.
    pub fn sadd_bounded(&self, set: &str, member: &str, limit: usize) -> StateResult<bool> {
        let prefix = prefix_of(set);
        let key = composite(set, member);
        self.write(|txn| {
            let mut table = txn.open_table(SETS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Ok(false);
            }
            let mut count = 0usize;
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (k, _) = entry.map_err(map_err!(Read))?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                count += 1;
            }
            if count >= limit {
                return Ok(false);
            }
            table.insert(key.as_str(), ()).map_err(map_err!(Write))?;
            Ok(true)
        })
    }

    // ── Hashes ─────────────────────────────────────────────────────

    pub fn hset(&self, key: &str, field: &str, value: &str) -> StateResult<()> {
        self.hset_many(key, &[(field, value)])
    }

    /// Set several fields of `key` in one transaction.
    pub fn hset_many(&self, key: &str, pairs: &[(&str, &str)]) -> StateResult<()> {
        let now = epoch_secs();
        self.write(|txn| {
            purge_if_expired(txn, key, now)?;
            let mut table = txn.open_table(HASHES).map_err(map_err!(Table))?;
            for (field, value) in pairs {
                let composite = composite(key, field);
                table
                    .insert(composite.as_str(), *value)
                    .map_err(map_err!(Write))?;
            }
            Ok(())
        })
    }

    pub fn hget(&self, key: &str, field: &str) -> StateResult<Option<String>> {
        let now = epoch_secs();
        let composite = composite(key, field);
        self.read(|txn| {
            if expired_at(txn, key, now)? {
                return Ok(None);
            }
            let table = txn.open_table(HASHES).map_err(map_err!(Table))?;
            let value = table
                .get(composite.as_str())
                .map_err(map_err!(Read))?
                .map(|v| v.value().to_string());
            Ok(value)
        })
    }

    pub fn hgetall(&self, key: &str) -> StateResult<BTreeMap<String, String>> {
        let now = epoch_secs();
        let prefix = prefix_of(key);
        self.read(|txn| {
            let mut fields = BTreeMap::new();
            if expired_at(txn, key, now)? {
                return Ok(fields);
            }
            let table = txn.open_table(HASHES).map_err(map_err!(Table))?;
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (k, v) = entry.map_err(map_err!(Read))?;
                match k.value().strip_prefix(prefix.as_str()) {
                    Some(field) => {
                        fields.insert(field.to_string(), v.value().to_string());
                    }
                    None => break,
                }
            }
            Ok(fields)
        })
    }

    /// Remove one hash field. Returns true if it existed.
    pub fn hdel(&self, key: &str, field: &str) -> StateResult<bool> {
        let composite = composite(key, field);
        self.write(|txn| {
            let mut table = txn.open_table(HASHES).map_err(map_err!(Table))?;
            let removed = table.remove(composite.as_str()).map_err(map_err!(Write))?;
            Ok(removed.is_some())
        })
    }

    /// Metadata of machine `name`, or `None` when it has no record.
    pub fn machine(&self, name: &str) -> StateResult<Option<MachineRecord>> {
        let fields = self.hgetall(&keys::machine(name))?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(MachineRecord::new(name, fields)))
    }

    // ── Values ─────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> StateResult<Option<String>> {
        let now = epoch_secs();
        self.read(|txn| {
            if expired_at(txn, key, now)? {
                return Ok(None);
            }
            let table = txn.open_table(VALUES).map_err(map_err!(Table))?;
            let value = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|v| v.value().to_string());
            Ok(value)
        })
    }

    pub fn set(&self, key: &str, value: &str) -> StateResult<()> {
        let now = epoch_secs();
        self.write(|txn| {
            purge_if_expired(txn, key, now)?;
            let mut table = txn.open_table(VALUES).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// Set `key` only if it holds no value. Returns true if this call set it.
    pub fn set_if_absent(&self, key: &str, value: &str) -> StateResult<bool> {
        let now = epoch_secs();
        self.write(|txn| {
            purge_if_expired(txn, key, now)?;
            let mut table = txn.open_table(VALUES).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Ok(false);
            }
            table.insert(key, value).map_err(map_err!(Write))?;
            Ok(true)
        })
    }

    // ── Counters ───────────────────────────────────────────────────

    pub fn counter(&self, key: &str) -> StateResult<i64> {
        self.read(|txn| {
            let table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let value = table.get(key).map_err(map_err!(Read))?.map(|v| v.value());
            Ok(value.unwrap_or(0))
        })
    }

    pub fn set_counter(&self, key: &str, value: i64) -> StateResult<()> {
        self.write(|txn| {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// Increment `key` only while it is below `limit`.
    ///
    /// Returns true if the increment happened. Check and increment share one
    /// transaction, so concurrent callers can never push the counter past
    /// `limit`.
    pub fn incr_if_below(&self, key: &str, limit: i64) -> StateResult<bool> {
        self.write(|txn| {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let current = table.get(key).map_err(map_err!(Read))?.map(|v| v.value());
            let current = current.unwrap_or(0);
            if current >= limit {
                return Ok(false);
            }
            table.insert(key, current + 1).map_err(map_err!(Write))?;
            Ok(true)
        })
    }

    /// Decrement `key`, never going below zero. Returns the new value.
    pub fn decr(&self, key: &str) -> StateResult<i64> {
        self.write(|txn| {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let current = table.get(key).map_err(map_err!(Read))?.map(|v| v.value());
            let next = (current.unwrap_or(0) - 1).max(0);
            table.insert(key, next).map_err(map_err!(Write))?;
            Ok(next)
        })
    }

    // ── Keys ───────────────────────────────────────────────────────

    /// Delete every piece of data stored under `key`. Returns true if
    /// anything existed.
    pub fn del(&self, key: &str) -> StateResult<bool> {
        let existed = self.write(|txn| delete_key(txn, key))?;
        debug!(%key, existed, "key deleted");
        Ok(existed)
    }

    /// Schedule `key` to expire `ttl` from now.
    pub fn expire(&self, key: &str, ttl: Duration) -> StateResult<()> {
        let deadline = epoch_secs().saturating_add(ttl.as_secs());
        self.write(|txn| {
            let mut table = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
            table.insert(key, deadline).map_err(map_err!(Write))?;
            Ok(())
        })
    }

    /// Seconds until `key` expires, or `None` if it has no deadline.
    pub fn ttl(&self, key: &str) -> StateResult<Option<u64>> {
        let now = epoch_secs();
        self.read(|txn| {
            let table = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
            let deadline = table.get(key).map_err(map_err!(Read))?.map(|v| v.value());
            Ok(deadline.map(|d| d.saturating_sub(now)))
        })
    }

    /// Delete every key whose deadline has passed. Returns how many were
    /// removed.
    pub fn purge_expired(&self) -> StateResult<usize> {
        let now = epoch_secs();
        let purged = self.write(|txn| {
            let due: Vec<String> = {
                let table = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
                let mut due = Vec::new();
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (k, deadline) = entry.map_err(map_err!(Read))?;
                    if deadline.value() <= now {
                        due.push(k.value().to_string());
                    }
                }
                due
            };
            for key in &due {
                delete_key(txn, key)?;
            }
            Ok(due.len())
        })?;
        if purged > 0 {
            debug!(purged, "expired keys purged");
        }
        Ok(purged)
    }
}

fn expired_at(txn: &ReadTransaction, key: &str, now: u64) -> StateResult<bool> {
    let table = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
    let expired = table
        .get(key)
        .map_err(map_err!(Read))?
        .is_some_and(|d| d.value() <= now);
    Ok(expired)
}

fn purge_if_expired(txn: &WriteTransaction, key: &str, now: u64) -> StateResult<()> {
    let expired = {
        let table = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
        let hit = table
            .get(key)
            .map_err(map_err!(Read))?
            .is_some_and(|d| d.value() <= now);
        hit
    };
    if expired {
        delete_key(txn, key)?;
    }
    Ok(())
}

fn delete_key(txn: &WriteTransaction, key: &str) -> StateResult<bool> {
    let prefix = prefix_of(key);
    let mut existed = remove_prefixed(txn, HASHES, &prefix)? > 0;
    existed |= remove_prefixed(txn, SETS, &prefix)? > 0;
    {
        let mut table = txn.open_table(VALUES).map_err(map_err!(Table))?;
        existed |= table.remove(key).map_err(map_err!(Write))?.is_some();
    }
    {
        let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        existed |= table.remove(key).map_err(map_err!(Write))?.is_some();
    }
    {
        let mut table = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
        table.remove(key).map_err(map_err!(Write))?;
    }
    Ok(existed)
}

fn remove_prefixed<V: Value + 'static>(
    txn: &WriteTransaction,
    definition: TableDefinition<'static, &'static str, V>,
    prefix: &str,
) -> StateResult<usize> {
    let mut table = txn.open_table(definition).map_err(map_err!(Table))?;
    let doomed: Vec<String> = {
        let mut doomed = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (k, _) = entry.map_err(map_err!(Read))?;
            if !k.value().starts_with(prefix) {
                break;
            }
            doomed.push(k.value().to_string());
        }
        doomed
    };
    for key in &doomed {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(doomed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Queue;

    fn store() -> InventoryStore {
        InventoryStore::open_in_memory().unwrap()
    }

    #[test]
    fn set_membership() {
        let s = store();
        assert!(s.sadd("ready:debian", "vm-b").unwrap());
        assert!(s.sadd("ready:debian", "vm-a").unwrap());
        assert!(!s.sadd("ready:debian", "vm-a").unwrap());
        assert!(s.sadd("ready:debian-extra", "vm-c").unwrap());

        assert_eq!(s.smembers("ready:debian").unwrap(), vec!["vm-a", "vm-b"]);
        assert_eq!(s.scard("ready:debian").unwrap(), 2);
        assert!(s.sismember("ready:debian", "vm-b").unwrap());
        assert!(!s.sismember("ready:debian", "vm-c").unwrap());

        assert!(s.srem("ready:debian", "vm-b").unwrap());
        assert!(!s.srem("ready:debian", "vm-b").unwrap());
        assert_eq!(s.smembers("ready:debian").unwrap(), vec!["vm-a"]);
    }

    #[test]
    fn smove_only_moves_existing_members() {
        let s = store();
        let pending = Queue::Pending.key("debian");
        let ready = Queue::Ready.key("debian");
        s.sadd(&pending, "vm-1").unwrap();

        assert!(s.smove(&pending, &ready, "vm-1").unwrap());
        assert!(!s.sismember(&pending, "vm-1").unwrap());
        assert!(s.sismember(&ready, "vm-1").unwrap());

        assert!(!s.smove(&pending, &ready, "vm-2").unwrap());
        assert!(!s.sismember(&ready, "vm-2").unwrap());
    }

    #[test]
    fn spop_drains_in_order() {
        let s = store();
        s.sadd("tasks:disk", "vm-2:10").unwrap();
        s.sadd("tasks:disk", "vm-1:20").unwrap();
        assert_eq!(s.spop("tasks:disk").unwrap().as_deref(), Some("vm-1:20"));
        assert_eq!(s.spop("tasks:disk").unwrap().as_deref(), Some("vm-2:10"));
        assert_eq!(s.spop("tasks:disk").unwrap(), None);
    }

    #[test]
    fn bounded_add_respects_limit() {
        let s = store();
        assert!(s.sadd_bounded("migration", "a", 2).unwrap());
        assert!(!s.sadd_bounded("migration", "a", 2).unwrap());
        assert!(s.sadd_bounded("migration", "b", 2).unwrap());
        assert!(!s.sadd_bounded("migration", "c", 2).unwrap());
        assert_eq!(s.scard("migration").unwrap(), 2);
    }

    #[test]
    fn hash_fields() {
        let s = store();
        s.hset_many("vm:a", &[("pool", "debian"), ("clone", "100")])
            .unwrap();
        s.hset("vm:ab", "pool", "other").unwrap();

        assert_eq!(s.hget("vm:a", "pool").unwrap().as_deref(), Some("debian"));
        let all = s.hgetall("vm:a").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["clone"], "100");

        assert!(s.hdel("vm:a", "clone").unwrap());
        assert!(!s.hdel("vm:a", "clone").unwrap());

        let rec = s.machine("a").unwrap().unwrap();
        assert_eq!(rec.pool(), Some("debian"));
        assert!(s.machine("missing").unwrap().is_none());
    }

    #[test]
    fn counters_are_bounded() {
        let s = store();
        assert!(s.incr_if_below("tasks:clone", 2).unwrap());
        assert!(s.incr_if_below("tasks:clone", 2).unwrap());
        assert!(!s.incr_if_below("tasks:clone", 2).unwrap());
        assert_eq!(s.counter("tasks:clone").unwrap(), 2);

        assert_eq!(s.decr("tasks:clone").unwrap(), 1);
        assert_eq!(s.decr("tasks:clone").unwrap(), 0);
        assert_eq!(s.decr("tasks:clone").unwrap(), 0);

        s.set_counter("tasks:clone", 7).unwrap();
        assert_eq!(s.counter("tasks:clone").unwrap(), 7);
    }

    #[test]
    fn set_if_absent_is_a_guard() {
        let s = store();
        assert!(s.set_if_absent("hostselector:checking", "1").unwrap());
        assert!(!s.set_if_absent("hostselector:checking", "1").unwrap());
        assert!(s.del("hostselector:checking").unwrap());
        assert!(s.set_if_absent("hostselector:checking", "1").unwrap());
    }

    #[test]
    fn del_removes_all_shapes() {
        let s = store();
        s.hset("vm:a", "pool", "debian").unwrap();
        s.sadd("migration", "vm-a").unwrap();
        assert!(s.del("vm:a").unwrap());
        assert!(s.del("migration").unwrap());
        assert!(s.hgetall("vm:a").unwrap().is_empty());
        assert_eq!(s.scard("migration").unwrap(), 0);
        assert!(!s.del("vm:a").unwrap());
    }

    #[test]
    fn expiry_hides_and_purges() {
        let s = store();
        s.hset("vm:gone", "pool", "debian").unwrap();
        s.hset("vm:kept", "pool", "debian").unwrap();
        s.expire("vm:gone", Duration::ZERO).unwrap();
        s.expire("vm:kept", Duration::from_secs(3600)).unwrap();

        assert!(s.hget("vm:gone", "pool").unwrap().is_none());
        assert!(s.ttl("vm:kept").unwrap().unwrap() > 3500);
        assert_eq!(s.ttl("vm:none").unwrap(), None);

        assert_eq!(s.purge_expired().unwrap(), 1);
        assert!(s.ttl("vm:gone").unwrap().is_none());
        assert!(s.hget("vm:kept", "pool").unwrap().is_some());
    }

    #[test]
    fn write_to_expired_key_starts_fresh() {
        let s = store();
        s.hset_many("vm:a", &[("pool", "debian"), ("destroy", "1")])
            .unwrap();
        s.expire("vm:a", Duration::ZERO).unwrap();
        s.hset("vm:a", "pool", "other").unwrap();
        let all = s.hgetall("vm:a").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["pool"], "other");
        assert_eq!(s.ttl("vm:a").unwrap(), None);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.redb");
        {
            let s = InventoryStore::open(&path).unwrap();
            s.sadd("ready:debian", "vm-1").unwrap();
            s.set_counter("tasks:clone", 3).unwrap();
        }
        let s = InventoryStore::open(&path).unwrap();
        assert!(s.sismember("ready:debian", "vm-1").unwrap());
        assert_eq!(s.counter("tasks:clone").unwrap(), 3);
    }
}
