//! warmpool-metrics — observability for the pool manager.
//!
//! Metric names are dotted strings scoped by pool or host, for example
//! `clone.debian`, `ready.debian`, `migrate_from.esx-01`.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── increment() ← failures, migrations per source/destination host
//!   ├── gauge()     ← ready/running queue sizes per pool
//!   ├── timing()    ← clone, boot, destroy, migrate durations
//!   └── snapshot()  → point-in-time copy for logging and tests
//! ```

pub mod collector;

pub use collector::{MetricsCollector, MetricsSnapshot, TimingSummary};
