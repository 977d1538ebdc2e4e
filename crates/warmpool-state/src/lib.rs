//! warmpool-state — the persistent inventory store.
//!
//! Backed by [redb](https://docs.rs/redb), the store exposes a small set of
//! atomic primitives (set membership and move, hash fields, counters, flags,
//! key expiry) that the pool manager uses as its only synchronization point.
//! Every public method runs in its own write or read transaction, so a
//! `smove` can never leave a member in neither or both sets.
//!
//! # Layout
//!
//! ```text
//! sets      "{set}\x1f{member}"  -> ()
//! hashes    "{key}\x1f{field}"   -> value
//! values    "{key}"              -> value
//! counters  "{key}"              -> i64
//! expiry    "{key}"              -> deadline (epoch secs)
//! ```
//!
//! Logical key names (queues, machine records, task queues) live in [`keys`].

pub mod error;
pub mod keys;
pub mod record;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use keys::Queue;
pub use record::MachineRecord;
pub use store::InventoryStore;
