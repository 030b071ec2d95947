use crate::events::{AnalyticsEvent, EventPayload, EventType, Properties};
use crate::error::SchemaResult;
use crate::SCHEMA_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Flat event representation sent to the collection endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEvent {
    /// Caller-supplied idempotency key, or a generated UUID
    pub event_id: String,
    pub event_type: EventType,
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    pub anonymous_id: String,
    pub session_id: String,
    /// Caller properties merged with payload and context fields
    pub properties: Properties,
}

/// Convert an enriched event into its export shape.
///
/// Conversions keep their idempotency key; events without an id get a fresh
/// UUID. Caller properties never override payload or context fields.
pub fn transform_event_for_export(event: &AnalyticsEvent) -> ExportEvent {
    let event_id = event
        .payload
        .event_id()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut properties = event.properties.clone();
    let ctx = &event.standard;

    match &event.payload {
        EventPayload::PageView {
            page_name,
            previous_page,
        } => {
            properties.insert("page_name".into(), Value::from(page_name.clone()));
            if let Some(prev) = previous_page {
                properties.insert("previous_page".into(), Value::from(prev.clone()));
            }
        }
        EventPayload::Track { .. } => {}
        EventPayload::Conversion {
            conversion_type,
            value,
            currency,
            ..
        } => {
            properties.insert(
                "conversion_type".into(),
                Value::from(conversion_type.clone()),
            );
            if let Some(value) = value {
                properties.insert("value".into(), Value::from(*value));
            }
            if let Some(currency) = currency {
                properties.insert("currency".into(), Value::from(currency.clone()));
            }
        }
    }

    let optional = [
        ("page_url", ctx.page_url.as_deref()),
        ("page_path", ctx.page_path.as_deref()),
        ("page_title", ctx.page_title.as_deref()),
        ("referrer", ctx.referrer.as_deref()),
    ];
    for (key, value) in optional.into_iter().chain(ctx.utm.fields()) {
        if let Some(value) = value {
            properties.insert(key.into(), Value::from(value));
        }
    }

    properties.insert("device_class".into(), Value::from(ctx.device_class.as_str()));
    properties.insert("locale".into(), Value::from(ctx.locale.clone()));
    properties.insert("timezone".into(), Value::from(ctx.timezone.clone()));
    properties.insert("environment".into(), Value::from(ctx.environment.clone()));
    properties.insert("app_version".into(), Value::from(ctx.app_version.clone()));
    properties.insert(
        "consent_state_version".into(),
        Value::from(ctx.consent_state_version),
    );
    properties.insert(
        "client_timestamp_ms".into(),
        Value::from(ctx.client_timestamp_ms),
    );

    ExportEvent {
        event_id,
        event_type: event.event_type(),
        event_name: event.name().to_string(),
        timestamp: ctx.timestamp,
        anonymous_id: ctx.anonymous_id.clone(),
        session_id: ctx.session_id.clone(),
        properties,
    }
}

/// A retryable unit of buffered events.
///
/// Created when the buffer flushes, dropped on confirmed delivery, and kept in
/// the failed-batch store when retries are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBatch {
    pub batch_id: Uuid,
    pub events: Vec<ExportEvent>,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub schema_version: u32,
    /// Number of failed delivery rounds
    #[serde(default)]
    pub retry_count: u32,
    /// Last error message from a failed delivery
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Request body for `POST` to the collection endpoint
#[derive(Debug, Serialize)]
pub struct BatchPayload<'a> {
    pub batch_id: Uuid,
    pub events: &'a [ExportEvent],
    pub created_at: DateTime<Utc>,
    pub source: &'a str,
    pub schema_version: u32,
}

impl ExportBatch {
    pub fn new(source: impl Into<String>, events: Vec<ExportEvent>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            events,
            created_at: Utc::now(),
            source: source.into(),
            schema_version: SCHEMA_VERSION,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Wire body; retry bookkeeping stays local
    pub fn payload(&self) -> BatchPayload<'_> {
        BatchPayload {
            batch_id: self.batch_id,
            events: &self.events,
            created_at: self.created_at,
            source: &self.source,
            schema_version: self.schema_version,
        }
    }

    pub fn to_json_bytes(&self) -> SchemaResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload())?)
    }

    /// Record a failed delivery round
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
    }
}
