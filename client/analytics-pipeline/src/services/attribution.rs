use crate::storage::StorageBackends;
use crate::storage_keys;
use client_storage::LayeredStore;
use event_schema::UtmParameters;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Which campaign sighting wins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionPolicy {
    /// Keep the first parameters ever seen
    #[default]
    FirstTouch,
    /// Every sighting overwrites
    LastTouch,
    /// First touch, scoped to the session store
    Session,
}

impl AttributionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionPolicy::FirstTouch => "first-touch",
            AttributionPolicy::LastTouch => "last-touch",
            AttributionPolicy::Session => "session",
        }
    }
}

impl FromStr for AttributionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "first-touch" => Ok(AttributionPolicy::FirstTouch),
            "last-touch" => Ok(AttributionPolicy::LastTouch),
            "session" => Ok(AttributionPolicy::Session),
            other => Err(format!("unknown attribution policy '{}'", other)),
        }
    }
}

/// Parse absolute URLs as-is and resolve paths against a placeholder origin
fn parse_url(raw: &str) -> Option<Url> {
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse("http://localhost")
            .and_then(|base| base.join(raw))
            .ok(),
        Err(e) => {
            warn!(url = raw, error = %e, "Ignoring unparseable URL for attribution");
            None
        }
    }
}

pub fn utm_from_url(raw: &str) -> UtmParameters {
    parse_url(raw)
        .map(|url| UtmParameters::from_query_pairs(url.query_pairs()))
        .unwrap_or_default()
}

/// Campaign parameter capture
pub struct AttributionCapture {
    durable: Arc<LayeredStore>,
    session: Arc<LayeredStore>,
}

impl AttributionCapture {
    pub fn new(storage: &StorageBackends) -> Self {
        Self {
            durable: storage.durable.clone(),
            session: storage.session.clone(),
        }
    }

    fn store_for(&self, policy: AttributionPolicy) -> (&LayeredStore, &'static str) {
        match policy {
            AttributionPolicy::Session => (self.session.as_ref(), storage_keys::UTM_SESSION),
            _ => (self.durable.as_ref(), storage_keys::UTM_DURABLE),
        }
    }

    /// Capture campaign parameters from `url` under `policy` and return the
    /// parameters in effect for that policy afterwards.
    pub fn capture_utm(&self, url: &str, policy: AttributionPolicy) -> Option<UtmParameters> {
        let seen = utm_from_url(url);
        let (store, key) = self.store_for(policy);
        let stored = store.get_json::<UtmParameters>(key).filter(|p| !p.is_empty());

        match (policy, stored) {
            (AttributionPolicy::LastTouch, stored) if seen.is_empty() => stored,
            (AttributionPolicy::LastTouch, _) => {
                debug!(source = ?seen.utm_source, "Captured last-touch campaign");
                store.set_json(key, &seen);
                Some(seen)
            }
            (_, Some(stored)) => Some(stored),
            (_, None) if seen.is_empty() => None,
            (policy, None) => {
                debug!(source = ?seen.utm_source, policy = policy.as_str(), "Captured campaign");
                store.set_json(key, &seen);
                Some(seen)
            }
        }
    }

    /// Read without capturing; session-scoped parameters take precedence
    pub fn get_utm(&self) -> Option<UtmParameters> {
        self.session
            .get_json::<UtmParameters>(storage_keys::UTM_SESSION)
            .filter(|p| !p.is_empty())
            .or_else(|| {
                self.durable
                    .get_json::<UtmParameters>(storage_keys::UTM_DURABLE)
                    .filter(|p| !p.is_empty())
            })
    }
}
