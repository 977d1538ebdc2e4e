use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider class '{0}'")]
    UnknownClass(String),

    #[error("invalid option for provider '{provider}': {message}")]
    InvalidOption { provider: String, message: String },

    #[error("machine '{0}' not found")]
    MachineNotFound(String),

    #[error("no hosts reported for cluster '{0}'")]
    NoHosts(String),

    #[error("{operation} failed for '{machine}': {message}")]
    Operation {
        operation: &'static str,
        machine: String,
        message: String,
    },
}
