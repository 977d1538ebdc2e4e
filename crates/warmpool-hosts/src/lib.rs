//! warmpool-hosts — the host selection subsystem.
//!
//! Keeps, per cluster, the least-loaded hosts of each compatibility class
//! and hands them out round-robin to the migration workflow.
//!
//! # Components
//!
//! - **`selection`** — pure candidate selection (class partitioning, below-average filter)
//! - **`cache`** — `HostCache`: refresh with a persisted re-entrancy guard, rotation, bounded stale-wait

pub mod cache;
pub mod error;
pub mod selection;

pub use cache::HostCache;
pub use error::HostSelectionError;
pub use selection::{ClusterCandidates, partition_by_class, select_least_used};
