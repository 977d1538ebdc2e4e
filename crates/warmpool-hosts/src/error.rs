use thiserror::Error;
use warmpool_provider::ProviderError;
use warmpool_state::StateError;

#[derive(Debug, Error)]
pub enum HostSelectionError {
    #[error("no candidate host in cluster '{cluster}' for class '{class}'")]
    NoCandidate { cluster: String, class: String },

    #[error("cluster '{0}' is not targeted by any pool")]
    UnknownCluster(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
