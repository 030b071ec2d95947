//! Consent-gated client analytics pipeline
//!
//! Captures page views, custom events and conversions, checks them against
//! the visitor's consent, runs them through a cost-aware admission gate,
//! enriches them with identity and campaign context, fans them out to
//! registered destinations, and batches them for the collection endpoint
//! with retry and durable replay.
//!
//! # Example
//!
//! ```rust,no_run
//! use analytics_pipeline::{Analytics, PipelineConfig, Properties, TrackOptions};
//!
//! # fn main() -> Result<(), analytics_pipeline::PipelineError> {
//! let analytics = Analytics::builder(PipelineConfig::default()).build()?;
//! analytics.init();
//! analytics.consent().accept_all();
//! analytics.track("cta_click", Properties::new(), TrackOptions::default());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod services;
pub mod storage;
pub mod storage_keys;

pub use config::PipelineConfig;
pub use error::{DestinationError, PipelineError, PipelineResult, TransportError};
pub use event_schema::{AnalyticsEvent, Properties};
pub use metrics::PipelineMetrics;
pub use services::attribution::{AttributionCapture, AttributionPolicy};
pub use services::consent::{
    ConsentCategory, ConsentSignal, ConsentState, ConsentStore, ConsentUpdate, SubscriptionId,
};
pub use services::context::{ClientContext, PageContext};
pub use services::cost_control::{AdmissionDecision, CostController, DecisionReason, UsageMetrics};
pub use services::destination::{Destination, DestinationId, ExportDestination, FnDestination};
pub use services::dispatcher::{Analytics, AnalyticsBuilder, TrackOptions};
pub use services::export::{BatchTransport, ExportBuffer, FlushOutcome};
pub use services::identity::{AnonymousIdentity, IdentityManager};
pub use storage::StorageBackends;
