/// Event schema for the client analytics pipeline
///
/// This library defines the versioned shapes that travel through the pipeline:
/// the in-process `AnalyticsEvent` (a tagged union over page views, custom
/// tracks and conversions, each carrying a full `StandardProperties` set) and
/// the `ExportBatch` wire format posted to the collection endpoint.

// Batch wire format and export transformation
pub mod batch;
// Event model
pub mod events;
// Schema validation
pub mod validation;

mod error;

pub use batch::{transform_event_for_export, BatchPayload, ExportBatch, ExportEvent};
pub use error::{SchemaError, SchemaResult};
pub use events::{
    AnalyticsEvent, DeviceClass, EventPayload, EventType, Properties, StandardProperties,
    UtmParameters,
};
pub use validation::validate_event;

/// Current schema version for exported batches
pub const SCHEMA_VERSION: u32 = 1;
