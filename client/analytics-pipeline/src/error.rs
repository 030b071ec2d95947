use event_schema::SchemaError;
use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event rejected by schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] client_storage::StorageError),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Delivery failures at the export boundary
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint answered with a non-success status
    #[error("Endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Beacon refused to queue the payload; the caller should fall back
    #[error("Beacon rejected payload: {0}")]
    BeaconRejected(String),

    #[error("Failed to encode batch: {0}")]
    Encode(#[from] SchemaError),
}

impl TransportError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Status(code) => *code == 429 || *code >= 500,
            TransportError::Request(_) | TransportError::Timeout(_) => true,
            TransportError::BeaconRejected(_) => true,
            TransportError::Encode(_) => false,
        }
    }
}

/// Failure inside a registered destination handler
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("Destination {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Destination {0} panicked")]
    Panicked(String),
}
