use crate::storage::StorageBackends;
use crate::storage_keys;
use chrono::{DateTime, Utc};
use client_storage::LayeredStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Current layout of the persisted consent record
pub const CONSENT_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentCategory {
    Necessary,
    Analytics,
    Marketing,
}

impl ConsentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentCategory::Necessary => "necessary",
            ConsentCategory::Analytics => "analytics",
            ConsentCategory::Marketing => "marketing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentChoices {
    pub necessary: bool,
    pub analytics: bool,
    pub marketing: bool,
}

impl Default for ConsentChoices {
    fn default() -> Self {
        Self {
            necessary: true,
            analytics: false,
            marketing: false,
        }
    }
}

impl ConsentChoices {
    pub fn all() -> Self {
        Self {
            necessary: true,
            analytics: true,
            marketing: true,
        }
    }

    pub fn get(&self, category: ConsentCategory) -> bool {
        match category {
            ConsentCategory::Necessary => self.necessary,
            ConsentCategory::Analytics => self.analytics,
            ConsentCategory::Marketing => self.marketing,
        }
    }
}

/// Partial choice update; `None` leaves a category untouched.
/// Necessary consent cannot be changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentUpdate {
    pub analytics: Option<bool>,
    pub marketing: Option<bool>,
}

/// Persisted consent decision.
///
/// Older records missing fields are filled with defaults on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentState {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub choices: ConsentChoices,
    pub has_interacted: bool,
    pub banner_shown: bool,
    pub region: Option<String>,
}

impl Default for ConsentState {
    fn default() -> Self {
        Self {
            version: CONSENT_VERSION,
            timestamp: Utc::now(),
            choices: ConsentChoices::default(),
            has_interacted: false,
            banner_shown: false,
            region: None,
        }
    }
}

impl ConsentState {
    /// Whether `category` may be tracked under this state
    pub fn allows(&self, category: ConsentCategory) -> bool {
        match category {
            ConsentCategory::Necessary => true,
            other => self.has_interacted && self.choices.get(other),
        }
    }

    fn normalized(mut self) -> Self {
        self.choices.necessary = true;
        if self.version < CONSENT_VERSION {
            debug!(from = self.version, to = CONSENT_VERSION, "Migrating consent state");
            self.version = CONSENT_VERSION;
        }
        self
    }
}

/// Broadcast to consent subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ConsentSignal {
    Changed(ConsentState),
    Withdrawn,
}

pub type ConsentListener = Arc<dyn Fn(&ConsentSignal) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Owns the consent record and its subscribers.
///
/// Reads never fail: a missing or unreadable record yields the default
/// (necessary only, not interacted).
pub struct ConsentStore {
    durable: Arc<LayeredStore>,
    session: Arc<LayeredStore>,
    listeners: Mutex<Vec<(SubscriptionId, ConsentListener)>>,
    next_id: AtomicU64,
}

impl ConsentStore {
    pub fn new(storage: &StorageBackends) -> Self {
        Self {
            durable: storage.durable.clone(),
            session: storage.session.clone(),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn get(&self) -> ConsentState {
        self.durable
            .get_json::<ConsentState>(storage_keys::CONSENT)
            .map(ConsentState::normalized)
            .unwrap_or_default()
    }

    pub fn can_track(&self, category: ConsentCategory) -> bool {
        self.get().allows(category)
    }

    /// Persist `state` and notify subscribers.
    ///
    /// Revoking analytics or marketing removes all non-essential keys.
    pub fn save(&self, state: ConsentState) {
        let previous = self.get();
        let mut state = state.normalized();
        state.timestamp = Utc::now();

        if !self.durable.set_json(storage_keys::CONSENT, &state) {
            debug!("Consent saved to non-durable storage only");
        }

        if revokes_tracking(&previous, &state) {
            self.cleanup_non_essential();
        }

        info!(
            analytics = state.choices.analytics,
            marketing = state.choices.marketing,
            has_interacted = state.has_interacted,
            "Consent updated"
        );
        self.emit(&ConsentSignal::Changed(state));
    }

    pub fn accept_all(&self) {
        let mut state = self.get();
        state.choices = ConsentChoices::all();
        state.has_interacted = true;
        self.save(state);
    }

    pub fn accept_necessary_only(&self) {
        let mut state = self.get();
        state.choices = ConsentChoices::default();
        state.has_interacted = true;
        self.save(state);
    }

    pub fn update(&self, update: ConsentUpdate) {
        let mut state = self.get();
        if let Some(analytics) = update.analytics {
            state.choices.analytics = analytics;
        }
        if let Some(marketing) = update.marketing {
            state.choices.marketing = marketing;
        }
        state.has_interacted = true;
        self.save(state);
    }

    /// Reset to necessary only, clean up, and broadcast the withdrawal
    pub fn withdraw(&self) {
        let mut state = self.get();
        state.choices = ConsentChoices::default();
        state.has_interacted = true;
        self.save(state);
        // save() only cleans up on a transition; withdrawal always does
        self.cleanup_non_essential();
        info!("Consent withdrawn");
        self.emit(&ConsentSignal::Withdrawn);
    }

    /// Back to the never-asked state
    pub fn reset(&self) {
        self.save(ConsentState::default());
    }

    pub fn mark_banner_shown(&self) {
        let mut state = self.get();
        if state.banner_shown {
            return;
        }
        state.banner_shown = true;
        self.save(state);
    }

    pub fn set_region(&self, region: Option<String>) {
        let mut state = self.get();
        state.region = region;
        self.save(state);
    }

    /// Register a listener; delivery is synchronous, in registration order
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ConsentSignal) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn emit(&self, signal: &ConsentSignal) {
        // Listeners may subscribe or mutate consent themselves
        let listeners: Vec<ConsentListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(signal))).is_err() {
                error!("Consent listener panicked");
            }
        }
    }

    fn cleanup_non_essential(&self) {
        self.durable.remove_all(storage_keys::NON_ESSENTIAL_KEYS.iter().copied());
        self.session.remove_all(storage_keys::NON_ESSENTIAL_KEYS.iter().copied());
        debug!("Removed non-essential analytics keys");
    }
}

fn revokes_tracking(previous: &ConsentState, next: &ConsentState) -> bool {
    [ConsentCategory::Analytics, ConsentCategory::Marketing]
        .into_iter()
        .any(|c| previous.allows(c) && !next.allows(c))
}

impl std::fmt::Debug for ConsentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentStore")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}
