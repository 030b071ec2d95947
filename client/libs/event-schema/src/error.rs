//! Error types for event schema validation and encoding.

use thiserror::Error;

/// Result type alias for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Reasons an event can be rejected before it leaves the pipeline.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// A field required for the event's declared type is empty or absent
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Event name does not follow the naming rules
    #[error("Invalid event name '{0}': expected 1-40 chars of [a-z0-9_] starting with a letter")]
    InvalidEventName(String),

    /// A field holds a value outside its allowed range or format
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Too many custom properties on a single event
    #[error("Too many properties: {0} (max {max})", max = crate::validation::MAX_PROPERTIES)]
    TooManyProperties(usize),

    /// Standard properties failed declarative validation
    #[error("Invalid standard properties: {0}")]
    StandardProperties(#[from] validator::ValidationErrors),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
