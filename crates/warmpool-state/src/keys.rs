//! Logical key layout.
//!
//! Per-pool queues are sets named `{state}:{pool}`; per-machine metadata is
//! the hash `vm:{name}`. Global admission state and task queues use fixed
//! names.

use std::fmt;

/// Lifecycle queue a machine can belong to within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Clone requested, not yet confirmed ready.
    Pending,
    /// Booted and available for checkout.
    Ready,
    /// Checked out by a consumer.
    Running,
    /// Awaiting destruction.
    Completed,
    /// Seen in inventory without any queue membership.
    Discovered,
    /// Running machine queued for relocation.
    Migrating,
}

impl Queue {
    pub const ALL: [Queue; 6] = [
        Queue::Pending,
        Queue::Ready,
        Queue::Running,
        Queue::Completed,
        Queue::Discovered,
        Queue::Migrating,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Queue::Pending => "pending",
            Queue::Ready => "ready",
            Queue::Running => "running",
            Queue::Completed => "completed",
            Queue::Discovered => "discovered",
            Queue::Migrating => "migrating",
        }
    }

    /// Store key of this queue for `pool`.
    pub fn key(self, pool: &str) -> String {
        format!("{}:{pool}", self.as_str())
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global clone-in-flight counter.
pub const CLONE_TASKS: &str = "tasks:clone";

/// Global set of machines currently being evaluated for migration.
pub const MIGRATIONS: &str = "migration";

/// Disk attach requests, members `{machine}:{size_gb}`.
pub const DISK_TASKS: &str = "tasks:disk";

/// Snapshot create requests, members `{machine}:{snapshot}`.
pub const SNAPSHOT_TASKS: &str = "tasks:snapshot";

/// Snapshot revert requests, members `{machine}:{snapshot}`.
pub const REVERT_TASKS: &str = "tasks:snapshot-revert";

/// Re-entrancy guard held while the host candidate cache refreshes.
pub const HOST_SELECTION_GUARD: &str = "hostselector:checking";

/// Per-machine metadata hash.
pub fn machine(name: &str) -> String {
    format!("vm:{name}")
}

/// Checkout timestamps of running machines in `pool`.
pub fn active(pool: &str) -> String {
    format!("active:{pool}")
}

/// Flag set while `pool` has no ready machines.
pub fn empty_flag(pool: &str) -> String {
    format!("empty:{pool}")
}

/// Daily clone duration samples, fields `{pool}:{machine}`.
pub fn clone_timings(day: &str) -> String {
    format!("clone:{day}")
}

/// Daily clone-to-ready samples, fields `{pool}:{machine}`.
pub fn boot_timings(day: &str) -> String {
    format!("boot:{day}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_are_pool_scoped() {
        assert_eq!(Queue::Pending.key("debian"), "pending:debian");
        assert_eq!(Queue::Migrating.key("win"), "migrating:win");
        assert_eq!(Queue::Ready.to_string(), "ready");
    }

    #[test]
    fn all_queues_are_distinct() {
        let keys: std::collections::HashSet<_> =
            Queue::ALL.iter().map(|q| q.key("p")).collect();
        assert_eq!(keys.len(), 6);
    }

    #[test]
    fn machine_and_pool_keys() {
        assert_eq!(machine("poolvm-abc"), "vm:poolvm-abc");
        assert_eq!(active("debian"), "active:debian");
        assert_eq!(empty_flag("debian"), "empty:debian");
        assert_eq!(clone_timings("2026-01-02"), "clone:2026-01-02");
        assert_eq!(boot_timings("2026-01-02"), "boot:2026-01-02");
    }
}
