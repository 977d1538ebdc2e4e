//! Admission slots for expensive operations.
//!
//! A slot is taken atomically in the store and released when dropped, so
//! every admitted operation gives its slot back exactly once whether it
//! succeeds, fails or panics.

use tracing::warn;
use warmpool_state::{InventoryStore, StateResult, keys};

/// One unit of the global clone-in-flight counter.
pub struct CloneSlot {
    store: InventoryStore,
}

impl CloneSlot {
    /// Take a slot if fewer than `limit` clones are in flight.
    pub fn acquire(store: &InventoryStore, limit: u32) -> StateResult<Option<Self>> {
        if store.incr_if_below(keys::CLONE_TASKS, i64::from(limit))? {
            Ok(Some(Self {
                store: store.clone(),
            }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for CloneSlot {
    fn drop(&mut self) {
        if let Err(e) = self.store.decr(keys::CLONE_TASKS) {
            warn!(error = %e, "failed to release clone slot");
        }
    }
}

/// Membership of one machine in the global migration-in-flight set.
pub struct MigrationSlot {
    store: InventoryStore,
    machine: String,
}

impl MigrationSlot {
    /// Reserve a slot for `machine` if fewer than `limit` migrations are in
    /// flight.
    pub fn acquire(store: &InventoryStore, machine: &str, limit: u32) -> StateResult<Option<Self>> {
        if store.sadd_bounded(keys::MIGRATIONS, machine, limit as usize)? {
            Ok(Some(Self {
                store: store.clone(),
                machine: machine.to_string(),
            }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for MigrationSlot {
    fn drop(&mut self) {
        if let Err(e) = self.store.srem(keys::MIGRATIONS, &self.machine) {
            warn!(machine = %self.machine, error = %e, "failed to release migration slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_slots_are_bounded_and_released() {
        let store = InventoryStore::open_in_memory().unwrap();
        let a = CloneSlot::acquire(&store, 2).unwrap().unwrap();
        let b = CloneSlot::acquire(&store, 2).unwrap().unwrap();
        assert!(CloneSlot::acquire(&store, 2).unwrap().is_none());
        assert_eq!(store.counter(keys::CLONE_TASKS).unwrap(), 2);

        drop(a);
        assert_eq!(store.counter(keys::CLONE_TASKS).unwrap(), 1);
        drop(b);
        assert_eq!(store.counter(keys::CLONE_TASKS).unwrap(), 0);
    }

    #[test]
    fn migration_slot_released_on_drop() {
        let store = InventoryStore::open_in_memory().unwrap();
        let slot = MigrationSlot::acquire(&store, "vm-1", 1).unwrap().unwrap();
        assert!(MigrationSlot::acquire(&store, "vm-2", 1).unwrap().is_none());
        assert!(store.sismember(keys::MIGRATIONS, "vm-1").unwrap());
        drop(slot);
        assert_eq!(store.scard(keys::MIGRATIONS).unwrap(), 0);
    }
}
