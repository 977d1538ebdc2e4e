use thiserror::Error;
use warmpool_core::{ConfigError, TimestampError};
use warmpool_hosts::HostSelectionError;
use warmpool_provider::ProviderError;
use warmpool_state::StateError;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("host selection error: {0}")]
    HostSelection(#[from] HostSelectionError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TimestampParse(#[from] TimestampError),

    #[error("invalid disk size '{0}'")]
    InvalidDiskSize(String),

    #[error("unable to determine which pool '{0}' belongs to")]
    UnknownPool(String),

    #[error("pool '{pool}' uses provider '{provider}', which was not created")]
    MissingProvider { pool: String, provider: String },

    #[error("malformed task '{item}' in {queue}")]
    MalformedTask { queue: String, item: String },

    #[error("inventory listing failed for pool '{pool}': {source}")]
    InventoryListing {
        pool: String,
        #[source]
        source: ProviderError,
    },

    #[error("failed to generate machine name: {0}")]
    Entropy(String),
}
