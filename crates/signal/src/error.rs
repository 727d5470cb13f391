use thiserror::Error;

/// Errors that can occur in the signal transport.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("service '{0}' is already registered on the bus")]
    DuplicateService(String),
}
