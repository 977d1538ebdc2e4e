//! warmpool-core — configuration and shared helpers.
//!
//! Everything here is plain data: the TOML configuration model read at
//! startup and the timestamp helpers every other crate uses to stamp and
//! compare machine lifecycle events.

pub mod config;
pub mod time;

pub use config::{
    Config, ConfigError, GlobalSettings, HostSelectionSettings, LoopDelaySettings,
    MigrationLimit, PoolSettings, ProviderSettings,
};
pub use time::{TimestampError, epoch_secs, format_secs, parse_timestamp, today};
