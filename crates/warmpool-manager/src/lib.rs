//! warmpool-manager — keeps every configured pool topped up with ready machines.
//!
//! One orchestrator loop runs per pool, alongside the disk and snapshot
//! task workers and the host selector. The [`Supervisor`] owns all of them
//! and restarts any loop that exits.
//!
//! # Architecture
//!
//! ```text
//! Supervisor
//!   ├── PoolOrchestrator (one per pool)
//!   │   ├── tick(): inventory → running → ready → pending → completed
//!   │   │           → discovered → migrating → repopulate
//!   │   ├── LoopDelay (exponential idle backoff)
//!   │   └── sleep_or_wake (early wakeup on ready-queue change)
//!   ├── disk_manager     (tasks:disk)
//!   ├── snapshot_manager (tasks:snapshot, tasks:snapshot-revert)
//!   └── host_selector    (HostCache::run)
//!
//! Context
//!   ├── InventoryStore   (queues, records, admission counters)
//!   ├── providers        (provider name → Arc<dyn Provider>)
//!   ├── HostCache
//!   ├── MetricsCollector
//!   └── Dispatcher       (fire-and-forget per-machine operations)
//! ```
//!
//! Queue membership in the store is the only lock on a machine: every
//! transition is a single atomic `smove`.

pub mod admission;
pub mod backoff;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod migration;
pub mod orchestrator;
pub mod supervisor;
pub mod tasks;

pub use admission::{CloneSlot, MigrationSlot};
pub use backoff::{LoopDelay, WakeReason, sleep_or_wake};
pub use context::Context;
pub use dispatch::Dispatcher;
pub use error::{ManagerError, ManagerResult};
pub use migration::MigrationOutcome;
pub use orchestrator::{EmptyTransition, PoolOrchestrator, TickSummary};
pub use supervisor::{Supervisor, WorkerKind};
pub use tasks::TaskQueue;
