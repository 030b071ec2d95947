//! Per-type validation applied after enrichment and before fan-out.

use crate::error::{SchemaError, SchemaResult};
use crate::events::{AnalyticsEvent, EventPayload};
use validator::Validate;

/// Maximum length of a track or conversion event name
pub const MAX_EVENT_NAME_LEN: usize = 40;
/// Maximum number of caller-supplied properties per event
pub const MAX_PROPERTIES: usize = 25;

/// Reject events missing fields required for their declared type.
pub fn validate_event(event: &AnalyticsEvent) -> SchemaResult<()> {
    event.standard.validate()?;

    if event.properties.len() > MAX_PROPERTIES {
        return Err(SchemaError::TooManyProperties(event.properties.len()));
    }

    match &event.payload {
        EventPayload::PageView { page_name, .. } => {
            if page_name.trim().is_empty() {
                return Err(SchemaError::MissingField("page_name"));
            }
        }
        EventPayload::Track { event_name, event_id } => {
            validate_event_name(event_name)?;
            if matches!(event_id, Some(id) if id.trim().is_empty()) {
                return Err(SchemaError::MissingField("event_id"));
            }
        }
        EventPayload::Conversion {
            event_name,
            event_id,
            conversion_type,
            value,
            currency,
        } => {
            validate_event_name(event_name)?;
            if event_id.trim().is_empty() {
                return Err(SchemaError::MissingField("event_id"));
            }
            if conversion_type.trim().is_empty() {
                return Err(SchemaError::MissingField("conversion_type"));
            }
            if let Some(value) = value {
                if !value.is_finite() || *value < 0.0 {
                    return Err(SchemaError::InvalidValue {
                        field: "value",
                        reason: format!("{} is not a finite non-negative amount", value),
                    });
                }
            }
            if let Some(currency) = currency {
                validate_currency(currency)?;
            }
        }
    }

    Ok(())
}

/// Names are 1-40 chars of `[a-z0-9_]` and start with a letter.
pub fn validate_event_name(name: &str) -> SchemaResult<()> {
    if name.is_empty() {
        return Err(SchemaError::MissingField("event_name"));
    }

    let starts_with_letter = name
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase())
        .unwrap_or(false);
    let allowed_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if name.len() > MAX_EVENT_NAME_LEN || !starts_with_letter || !allowed_chars {
        return Err(SchemaError::InvalidEventName(name.to_string()));
    }

    Ok(())
}

fn validate_currency(currency: &str) -> SchemaResult<()> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(SchemaError::InvalidValue {
            field: "currency",
            reason: format!("'{}' is not a 3-letter ISO 4217 code", currency),
        })
    }
}
