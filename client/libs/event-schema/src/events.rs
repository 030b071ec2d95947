use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Free-form event properties supplied by the caller
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Coarse device class derived from the viewport width
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
    #[default]
    Unknown,
}

impl DeviceClass {
    /// Below 768px is mobile, below 1024px tablet, anything wider desktop.
    pub fn from_viewport_width(width: Option<u32>) -> Self {
        match width {
            None | Some(0) => DeviceClass::Unknown,
            Some(w) if w < 768 => DeviceClass::Mobile,
            Some(w) if w < 1024 => DeviceClass::Tablet,
            Some(_) => DeviceClass::Desktop,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Unknown => "unknown",
        }
    }
}

/// Campaign parameters captured from a landing URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
    /// Google Ads click id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gclid: Option<String>,
    /// Meta click id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fbclid: Option<String>,
}

impl UtmParameters {
    /// Collect campaign parameters from decoded query pairs. Unknown keys and
    /// empty values are ignored.
    pub fn from_query_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = UtmParameters::default();
        for (key, value) in pairs {
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "utm_source" => &mut params.utm_source,
                "utm_medium" => &mut params.utm_medium,
                "utm_campaign" => &mut params.utm_campaign,
                "utm_term" => &mut params.utm_term,
                "utm_content" => &mut params.utm_content,
                "gclid" => &mut params.gclid,
                "fbclid" => &mut params.fbclid,
                _ => continue,
            };
            *slot = Some(value.to_string());
        }
        params
    }

    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, v)| v.is_none())
    }

    /// Field name / value pairs in a stable order
    pub fn fields(&self) -> [(&'static str, Option<&str>); 7] {
        [
            ("utm_source", self.utm_source.as_deref()),
            ("utm_medium", self.utm_medium.as_deref()),
            ("utm_campaign", self.utm_campaign.as_deref()),
            ("utm_term", self.utm_term.as_deref()),
            ("utm_content", self.utm_content.as_deref()),
            ("gclid", self.gclid.as_deref()),
            ("fbclid", self.fbclid.as_deref()),
        ]
    }
}

/// Context fields attached to every dispatched event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StandardProperties {
    #[validate(length(min = 1))]
    pub anonymous_id: String,
    #[validate(length(min = 1))]
    pub session_id: String,

    pub page_url: Option<String>,
    pub page_path: Option<String>,
    pub page_title: Option<String>,
    pub referrer: Option<String>,

    #[serde(default)]
    pub utm: UtmParameters,

    #[serde(default)]
    pub device_class: DeviceClass,
    #[validate(length(min = 2))]
    pub locale: String,
    #[validate(length(min = 1))]
    pub timezone: String,

    #[validate(length(min = 1))]
    pub environment: String,
    #[validate(length(min = 1))]
    pub app_version: String,

    /// Version of the consent state the event was admitted under
    pub consent_state_version: u32,

    /// Wall-clock time of dispatch
    pub timestamp: DateTime<Utc>,
    /// Strictly increasing milliseconds since the pipeline started
    pub client_timestamp_ms: u64,
}

/// Discriminant of `EventPayload`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PageView,
    Track,
    Conversion,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::Track => "track",
            EventType::Conversion => "conversion",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific part of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    PageView {
        page_name: String,
        previous_page: Option<String>,
    },
    Track {
        event_name: String,
        /// Caller-supplied id; generated at export time when absent
        event_id: Option<String>,
    },
    Conversion {
        event_name: String,
        /// Idempotency key for this conversion
        event_id: String,
        conversion_type: String,
        value: Option<f64>,
        currency: Option<String>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::PageView { .. } => EventType::PageView,
            EventPayload::Track { .. } => EventType::Track,
            EventPayload::Conversion { .. } => EventType::Conversion,
        }
    }

    /// Page name for page views, event name otherwise
    pub fn name(&self) -> &str {
        match self {
            EventPayload::PageView { page_name, .. } => page_name,
            EventPayload::Track { event_name, .. } => event_name,
            EventPayload::Conversion { event_name, .. } => event_name,
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            EventPayload::PageView { .. } => None,
            EventPayload::Track { event_id, .. } => event_id.as_deref(),
            EventPayload::Conversion { event_id, .. } => Some(event_id),
        }
    }
}

/// A fully enriched event as handed to destinations and the export buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub payload: EventPayload,
    pub standard: StandardProperties,
    #[serde(default)]
    pub properties: Properties,
}

impl AnalyticsEvent {
    pub fn new(payload: EventPayload, standard: StandardProperties, properties: Properties) -> Self {
        Self {
            payload,
            standard,
            properties,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn name(&self) -> &str {
        self.payload.name()
    }
}
