//! warmpool-provider — the hypervisor capability interface.
//!
//! The pool manager never talks to a hypervisor directly. It holds one
//! [`Provider`] trait object per configured provider name, built at startup
//! by the [`ProviderRegistry`] from a provider-class token.
//!
//! # Architecture
//!
//! ```text
//! ProviderRegistry
//!   ├── register("dummy", dummy::build)
//!   └── build_all(&Config) → HashMap<provider name, Arc<dyn Provider>>
//!
//! Provider
//!   ├── machines_in_pool / get_machine / is_ready
//!   ├── create_machine / destroy_machine
//!   ├── attach_disk / create_snapshot / revert_snapshot
//!   ├── machine_placement / host_stats / rank_hosts
//!   └── relocate
//! ```

pub mod dummy;
pub mod error;
pub mod provider;
pub mod registry;
pub mod types;
pub mod utilization;

pub use dummy::DummyProvider;
pub use error::{ProviderError, ProviderResult};
pub use provider::{Provider, ProviderFuture};
pub use registry::{ProviderConstructor, ProviderRegistry};
pub use types::{HostStats, MachineAttrs, MachinePlacement, PowerState, RankedHost};
pub use utilization::rank_by_utilization;
