//! Keys owned by each pipeline component in the shared stores.
//!
//! A component only touches its own keys; other components go through its
//! accessor methods.

pub const CONSENT: &str = "analytics.consent";

pub const ANONYMOUS_ID: &str = "analytics.anonymous_id";
pub const SESSION: &str = "analytics.session";

/// First-touch and last-touch capture (durable store)
pub const UTM_DURABLE: &str = "analytics.utm";
/// Session-scoped capture (session store)
pub const UTM_SESSION: &str = "analytics.utm_session";

pub const USAGE_METRICS: &str = "analytics.usage_metrics";
pub const FAILED_BATCHES: &str = "analytics.failed_batches";

/// Everything removed when analytics or marketing consent is revoked.
/// The consent key itself is essential and survives.
pub const NON_ESSENTIAL_KEYS: &[&str] = &[
    ANONYMOUS_ID,
    SESSION,
    UTM_DURABLE,
    UTM_SESSION,
    USAGE_METRICS,
    FAILED_BATCHES,
];
