//! Public tracking surface
//!
//! [`Analytics`] wires the consent store, identity manager, attribution
//! capture, admission gate and export buffer together. Every public tracking
//! call returns a `bool` and never fails: denials, drops and destination
//! errors are logged and counted, not surfaced.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::services::attribution::AttributionCapture;
use crate::services::consent::{
    ConsentCategory, ConsentSignal, ConsentState, ConsentStore, SubscriptionId,
};
use crate::services::context::{ClientContext, MonotonicClock, PageContext};
use crate::services::cost_control::{CostController, UsageMetrics};
use crate::services::destination::{Destination, DestinationId, ExportDestination};
use crate::services::export::{transports_from_config, BatchTransport, ExportBuffer, FlushOutcome};
use crate::services::identity::{AnonymousIdentity, IdentityManager};
use crate::storage::StorageBackends;
use chrono::Utc;
use event_schema::{
    validate_event, AnalyticsEvent, DeviceClass, EventPayload, Properties, StandardProperties,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-call options for [`Analytics::track`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackOptions {
    /// Suppress repeats of this event for the lifetime of the instance
    pub fire_once: bool,
    /// Dedup key; defaults to the event name
    pub fire_once_key: Option<String>,
    /// Caller-supplied event id, kept through export
    pub event_id: Option<String>,
}

impl TrackOptions {
    pub fn once() -> Self {
        Self {
            fire_once: true,
            ..Default::default()
        }
    }

    pub fn once_with_key(key: impl Into<String>) -> Self {
        Self {
            fire_once: true,
            fire_once_key: Some(key.into()),
            event_id: None,
        }
    }
}

#[derive(Debug, Clone)]
enum QueuedCall {
    Track {
        name: String,
        properties: Properties,
        options: TrackOptions,
    },
    Page {
        name: String,
        properties: Properties,
    },
    Conversion {
        conversion_type: String,
        event_id: String,
        properties: Properties,
    },
}

#[derive(Debug, Default)]
struct InitState {
    initialized: bool,
    queue: VecDeque<QueuedCall>,
}

struct DispatchRequest {
    payload: EventPayload,
    /// Key used for the priority lookup
    gate_key: String,
    fire_once_key: Option<String>,
    properties: Properties,
    always_export: bool,
}

/// Builds an [`Analytics`] instance
pub struct AnalyticsBuilder {
    config: PipelineConfig,
    storage: Option<StorageBackends>,
    metrics: Option<PipelineMetrics>,
    transport: Option<Arc<dyn BatchTransport>>,
    beacon: Option<Arc<dyn BatchTransport>>,
    sampler: Option<Box<dyn Fn() -> f64 + Send + Sync>>,
}

impl AnalyticsBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            storage: None,
            metrics: None,
            transport: None,
            beacon: None,
            sampler: None,
        }
    }

    /// Defaults to the stores described by `config.storage`
    pub fn storage(mut self, storage: StorageBackends) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the HTTP transport built from `config.export.endpoint`
    pub fn transport(mut self, transport: Arc<dyn BatchTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn beacon(mut self, beacon: Arc<dyn BatchTransport>) -> Self {
        self.beacon = Some(beacon);
        self
    }

    pub fn sampler<F>(mut self, sampler: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.sampler = Some(Box::new(sampler));
        self
    }

    pub fn build(self) -> PipelineResult<Analytics> {
        self.config.validate()?;

        let storage = self
            .storage
            .unwrap_or_else(|| StorageBackends::from_config(&self.config.storage));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => PipelineMetrics::standalone()?,
        };

        let consent = Arc::new(ConsentStore::new(&storage));
        let identity = Arc::new(IdentityManager::new(&storage, self.config.identity.clone()));
        let attribution = AttributionCapture::new(&storage);

        let mut cost =
            CostController::new(self.config.cost_control.clone(), consent.clone(), &storage);
        if let Some(sampler) = self.sampler {
            cost = cost.with_sampler(sampler);
        }
        let cost = Arc::new(cost);

        let export = match (self.config.export.enabled, self.transport) {
            (false, _) => None,
            (true, transport) => {
                let (reliable, beacon) = match transport {
                    Some(reliable) => (reliable, self.beacon),
                    None => {
                        let (reliable, beacon) = transports_from_config(&self.config.export)?;
                        (reliable, Some(self.beacon.unwrap_or(beacon)))
                    }
                };
                let mut buffer = ExportBuffer::new(
                    self.config.export.clone(),
                    self.config.app.source.clone(),
                    consent.clone(),
                    &storage,
                    reliable,
                    metrics.clone(),
                );
                if let Some(beacon) = beacon {
                    buffer = buffer.with_beacon(beacon);
                }
                Some(buffer)
            }
        };

        let subscription = consent.subscribe(consent_reaction(
            identity.clone(),
            cost.clone(),
            export.clone(),
        ));

        info!(
            environment = %self.config.app.environment,
            export = export.is_some(),
            policy = self.config.attribution.policy.as_str(),
            "Analytics pipeline created"
        );

        Ok(Analytics {
            config: self.config,
            consent,
            identity,
            attribution,
            cost,
            export,
            metrics,
            destinations: RwLock::new(Vec::new()),
            next_destination: AtomicU64::new(1),
            fired: Mutex::new(HashSet::new()),
            init: Mutex::new(InitState::default()),
            page: RwLock::new(PageContext::default()),
            client: RwLock::new(ClientContext::default()),
            clock: MonotonicClock::new(),
            subscription,
        })
    }
}

/// Withdrawal stops identity caching and export; a later grant restarts export
fn consent_reaction(
    identity: Arc<IdentityManager>,
    cost: Arc<CostController>,
    export: Option<ExportBuffer>,
) -> impl Fn(&ConsentSignal) + Send + Sync + 'static {
    move |signal: &ConsentSignal| match signal {
        ConsentSignal::Withdrawn => {
            identity.clear_cache();
            cost.forget_session();
            if let Some(export) = &export {
                export.flush_then_disable();
            }
        }
        ConsentSignal::Changed(state) => {
            if let Some(export) = &export {
                if state.allows(ConsentCategory::Analytics) && !export.is_enabled() {
                    export.enable();
                }
            }
        }
    }
}

/// The analytics pipeline
pub struct Analytics {
    config: PipelineConfig,
    consent: Arc<ConsentStore>,
    identity: Arc<IdentityManager>,
    attribution: AttributionCapture,
    cost: Arc<CostController>,
    export: Option<ExportBuffer>,
    metrics: PipelineMetrics,
    destinations: RwLock<Vec<(DestinationId, Arc<dyn Destination>)>>,
    next_destination: AtomicU64,
    fired: Mutex<HashSet<String>>,
    init: Mutex<InitState>,
    page: RwLock<PageContext>,
    client: RwLock<ClientContext>,
    clock: MonotonicClock,
    subscription: SubscriptionId,
}

impl Analytics {
    pub fn builder(config: PipelineConfig) -> AnalyticsBuilder {
        AnalyticsBuilder::new(config)
    }

    /// Start dispatching and replay calls made before now, in order
    pub fn init(&self) {
        let queued = {
            let mut state = self.init.lock();
            if state.initialized {
                return;
            }
            state.initialized = true;
            std::mem::take(&mut state.queue)
        };

        if !queued.is_empty() {
            info!(count = queued.len(), "Replaying calls queued before init");
        }
        for call in queued {
            match call {
                QueuedCall::Track {
                    name,
                    properties,
                    options,
                } => {
                    self.track(&name, properties, options);
                }
                QueuedCall::Page { name, properties } => {
                    self.page(&name, properties);
                }
                QueuedCall::Conversion {
                    conversion_type,
                    event_id,
                    properties,
                } => {
                    self.conversion(&conversion_type, &event_id, properties);
                }
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.init.lock().initialized
    }

    /// Queue `call` if not yet initialized; returns true when queued
    fn defer(&self, call: impl FnOnce() -> QueuedCall) -> bool {
        let mut state = self.init.lock();
        if state.initialized {
            return false;
        }
        if state.queue.len() >= self.config.max_queued_calls {
            warn!(limit = self.config.max_queued_calls, "Pre-init queue full, dropping oldest call");
            state.queue.pop_front();
        }
        state.queue.push_back(call());
        true
    }

    pub fn track(&self, name: &str, properties: Properties, options: TrackOptions) -> bool {
        if self.defer(|| QueuedCall::Track {
            name: name.to_string(),
            properties: properties.clone(),
            options: options.clone(),
        }) {
            return true;
        }

        let fire_once_key = options
            .fire_once
            .then(|| options.fire_once_key.clone().unwrap_or_else(|| name.to_string()));

        self.dispatch(DispatchRequest {
            payload: EventPayload::Track {
                event_name: name.to_string(),
                event_id: options.event_id,
            },
            gate_key: name.to_string(),
            fire_once_key,
            properties,
            always_export: false,
        })
    }

    pub fn track_once(&self, name: &str, properties: Properties) -> bool {
        self.track(name, properties, TrackOptions::once())
    }

    pub fn track_once_with_key(&self, name: &str, key: &str, properties: Properties) -> bool {
        self.track(name, properties, TrackOptions::once_with_key(key))
    }

    pub fn page(&self, name: &str, properties: Properties) -> bool {
        if self.defer(|| QueuedCall::Page {
            name: name.to_string(),
            properties: properties.clone(),
        }) {
            return true;
        }

        let previous_page = self.page.read().previous_path.clone();
        self.dispatch(DispatchRequest {
            payload: EventPayload::PageView {
                page_name: name.to_string(),
                previous_page,
            },
            gate_key: "page_view".to_string(),
            fire_once_key: None,
            properties,
            always_export: false,
        })
    }

    /// Record a conversion at most once per `(conversion_type, event_id)`.
    ///
    /// `value` (number) and `currency` (string) are lifted out of
    /// `properties` into the conversion payload.
    pub fn conversion(&self, conversion_type: &str, event_id: &str, properties: Properties) -> bool {
        if self.defer(|| QueuedCall::Conversion {
            conversion_type: conversion_type.to_string(),
            event_id: event_id.to_string(),
            properties: properties.clone(),
        }) {
            return true;
        }

        let mut properties = properties;
        let value = match properties.remove("value") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(other) => {
                warn!(value = %other, "Ignoring non-numeric conversion value");
                None
            }
            None => None,
        };
        let currency = match properties.remove("currency") {
            Some(Value::String(s)) => Some(s),
            Some(_) | None => None,
        };

        self.dispatch(DispatchRequest {
            payload: EventPayload::Conversion {
                event_name: conversion_type.to_string(),
                event_id: event_id.to_string(),
                conversion_type: conversion_type.to_string(),
                value,
                currency,
            },
            gate_key: "conversion".to_string(),
            fire_once_key: Some(format!("conversion:{}:{}", conversion_type, event_id)),
            properties,
            always_export: true,
        })
    }

    fn dispatch(&self, request: DispatchRequest) -> bool {
        let name = request.payload.name().to_string();

        if let Some(key) = &request.fire_once_key {
            if self.fired.lock().contains(key) {
                debug!(event_name = %name, key = %key, "Already fired, skipping");
                self.metrics.record_drop("duplicate");
                return false;
            }
        }

        let consent = self.consent.get();
        if !consent.allows(ConsentCategory::Analytics) {
            debug!(event_name = %name, "No analytics consent");
            self.metrics.record_drop("consent_denied");
            return false;
        }

        let identity = self.identity.get_identity_with_fallback();
        self.cost.observe_session(&identity.session_id);

        let decision = self.cost.should_allow(&request.gate_key);
        self.metrics.sampling_rate.set(decision.sampling_rate);
        if !decision.allowed {
            debug!(event_name = %name, reason = %decision.reason, "Event not admitted");
            self.metrics.record_drop(decision.reason.as_str());
            return false;
        }

        let standard = self.standard_properties(&identity, consent.version);
        let event = AnalyticsEvent::new(request.payload, standard, request.properties);
        if let Err(e) = validate_event(&event) {
            warn!(event_name = %name, error = %e, "Event failed validation");
            self.metrics.record_drop("invalid");
            return false;
        }

        if let Some(key) = request.fire_once_key {
            if !self.fired.lock().insert(key) {
                // lost a race with a concurrent call for the same key
                return false;
            }
        }

        self.fan_out(&event, &consent);

        if request.always_export {
            if let Some(export) = &self.export {
                export.buffer_event(&event);
            }
        }

        self.cost.record_sent();
        self.metrics.events_admitted.inc();
        debug!(event_name = %name, event_type = %event.event_type(), "Event dispatched");
        true
    }

    fn fan_out(&self, event: &AnalyticsEvent, consent: &ConsentState) {
        let destinations: Vec<Arc<dyn Destination>> = self
            .destinations
            .read()
            .iter()
            .map(|(_, d)| d.clone())
            .collect();

        for destination in destinations {
            if !consent.allows(destination.category()) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| destination.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(destination = destination.name(), error = %e, "Destination failed");
                    self.metrics.destination_failures.inc();
                }
                Err(_) => {
                    error!(destination = destination.name(), "Destination panicked");
                    self.metrics.destination_failures.inc();
                }
            }
        }
    }

    fn standard_properties(
        &self,
        identity: &AnonymousIdentity,
        consent_version: u32,
    ) -> StandardProperties {
        let page = self.page.read().clone();
        let client = self.client.read().clone();
        let app = &self.config.app;

        StandardProperties {
            anonymous_id: identity.anonymous_id.clone(),
            session_id: identity.session_id.clone(),
            page_url: page.url,
            page_path: page.path,
            page_title: page.title,
            referrer: page.referrer,
            utm: self.attribution.get_utm().unwrap_or_default(),
            device_class: DeviceClass::from_viewport_width(client.viewport_width),
            locale: client.locale.unwrap_or_else(|| app.default_locale.clone()),
            timezone: client.timezone.unwrap_or_else(|| app.default_timezone.clone()),
            environment: app.environment.clone(),
            app_version: app.app_version.clone(),
            consent_state_version: consent_version,
            timestamp: Utc::now(),
            client_timestamp_ms: self.clock.now_ms(),
        }
    }

    /// Update page context and capture campaign parameters from `url`
    pub fn navigate(&self, url: &str, title: Option<String>) {
        self.page.write().navigate(url, title);
        if self.consent.can_track(ConsentCategory::Analytics) {
            self.attribution.capture_utm(url, self.config.attribution.policy);
        }
    }

    pub fn set_client_context(&self, client: ClientContext) {
        *self.client.write() = client;
    }

    pub fn register_destination(&self, destination: Arc<dyn Destination>) -> DestinationId {
        let id = DestinationId(self.next_destination.fetch_add(1, Ordering::Relaxed));
        info!(destination = destination.name(), "Destination registered");
        self.destinations.write().push((id, destination));
        id
    }

    pub fn unregister_destination(&self, id: DestinationId) -> bool {
        let mut destinations = self.destinations.write();
        let before = destinations.len();
        destinations.retain(|(existing, _)| *existing != id);
        destinations.len() != before
    }

    /// Opt track and page events into export
    pub fn register_export_destination(&self) -> PipelineResult<DestinationId> {
        let export = self
            .export
            .clone()
            .ok_or_else(|| PipelineError::Config("export is not enabled".to_string()))?;
        Ok(self.register_destination(Arc::new(ExportDestination::new(export))))
    }

    /// Page hidden or unloading
    pub fn on_page_hide(&self) {
        if let Some(export) = &self.export {
            export.on_page_hide();
        }
    }

    pub async fn flush(&self) -> FlushOutcome {
        match &self.export {
            Some(export) => export.flush_events().await,
            None => FlushOutcome::Empty,
        }
    }

    pub async fn retry_failed_batches(&self) -> usize {
        match &self.export {
            Some(export) => export.retry_failed_batches().await,
            None => 0,
        }
    }

    /// Wait for background flushes to finish
    pub async fn join_pending(&self) {
        if let Some(export) = &self.export {
            export.join_pending().await;
        }
    }

    pub fn consent(&self) -> &Arc<ConsentStore> {
        &self.consent
    }

    pub fn identity(&self) -> AnonymousIdentity {
        self.identity.get_identity_with_fallback()
    }

    pub fn usage_metrics(&self) -> UsageMetrics {
        self.cost.metrics()
    }

    pub fn export(&self) -> Option<&ExportBuffer> {
        self.export.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl Drop for Analytics {
    fn drop(&mut self) {
        self.consent.unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for Analytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analytics")
            .field("initialized", &self.is_initialized())
            .field("destinations", &self.destinations.read().len())
            .field("export", &self.export)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DestinationError, TransportError};
    use crate::services::destination::FnDestination;
    use crate::services::export::MockBatchTransport;
    use crate::storage_keys;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_destination(counter: Arc<AtomicUsize>) -> Arc<dyn Destination> {
        Arc::new(FnDestination::new("counter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn analytics() -> (Analytics, StorageBackends) {
        let storage = StorageBackends::in_memory();
        let analytics = Analytics::builder(PipelineConfig::default())
            .storage(storage.clone())
            .sampler(|| 0.0)
            .build()
            .unwrap();
        analytics.init();
        (analytics, storage)
    }

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_no_tracking_before_consent() {
        let (analytics, storage) = analytics();
        let count = Arc::new(AtomicUsize::new(0));
        analytics.register_destination(counting_destination(count.clone()));

        assert!(!analytics.track("cta_click", Properties::new(), TrackOptions::default()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!storage.durable.contains(storage_keys::ANONYMOUS_ID));
    }

    #[test]
    fn test_withdraw_blocks_tracking_and_clears_keys() {
        let (analytics, storage) = analytics();
        analytics.consent().accept_all();
        analytics.navigate("https://example.com/?utm_source=google", None);
        assert!(analytics.track("cta_click", Properties::new(), TrackOptions::default()));

        analytics.consent().withdraw();

        assert!(!analytics.consent().can_track(ConsentCategory::Analytics));
        assert!(!analytics.track("cta_click", Properties::new(), TrackOptions::default()));
        for key in storage_keys::NON_ESSENTIAL_KEYS {
            assert!(!storage.durable.contains(key), "{} left behind", key);
        }
    }

    #[test]
    fn test_withdraw_and_regrant_keeps_daily_count() {
        let (analytics, storage) = analytics();
        analytics.consent().accept_all();
        assert!(analytics.track("cta_click", Properties::new(), TrackOptions::default()));

        analytics.consent().withdraw();
        assert!(!storage.durable.contains(storage_keys::USAGE_METRICS));
        assert_eq!(analytics.usage_metrics().events_this_session, 0);

        analytics.consent().accept_all();
        assert!(analytics.track("cta_click", Properties::new(), TrackOptions::default()));
        let usage = analytics.usage_metrics();
        assert_eq!(usage.events_today, 2);
        assert_eq!(usage.events_this_session, 1);
    }

    #[test]
    fn test_fire_once_with_key_dispatches_once() {
        let (analytics, _) = analytics();
        analytics.consent().accept_all();
        let count = Arc::new(AtomicUsize::new(0));
        analytics.register_destination(counting_destination(count.clone()));

        assert!(analytics.track_once_with_key("evt", "k", Properties::new()));
        assert!(!analytics.track_once_with_key("evt", "k", Properties::new()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_conversion_is_idempotent_per_event_id() {
        let (analytics, _) = analytics();
        analytics.consent().accept_all();
        let count = Arc::new(AtomicUsize::new(0));
        analytics.register_destination(counting_destination(count.clone()));

        let details = props(&[("value", json!(49.5)), ("currency", json!("USD"))]);
        assert!(analytics.conversion("purchase", "order-1", details.clone()));
        assert!(!analytics.conversion("purchase", "order-1", details.clone()));
        assert!(analytics.conversion("purchase", "order-2", details));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_destination_is_isolated() {
        let (analytics, _) = analytics();
        analytics.consent().accept_all();
        let count = Arc::new(AtomicUsize::new(0));

        analytics.register_destination(Arc::new(FnDestination::new("broken", |_| {
            Err(DestinationError::Failed {
                name: "broken".into(),
                reason: "sdk not loaded".into(),
            })
        })));
        analytics.register_destination(Arc::new(FnDestination::new("panicky", |_| {
            panic!("adapter bug")
        })));
        analytics.register_destination(counting_destination(count.clone()));

        assert!(analytics.page("home", Properties::new()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(analytics.metrics.destination_failures.get(), 2);
    }

    #[test]
    fn test_destination_consent_category() {
        let (analytics, _) = analytics();
        analytics.consent().update(crate::services::consent::ConsentUpdate {
            analytics: Some(true),
            marketing: Some(false),
        });
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let ads = FnDestination::new("ads", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .with_category(ConsentCategory::Marketing);
        let id = analytics.register_destination(Arc::new(ads));

        assert!(analytics.track("cta_click", Properties::new(), TrackOptions::default()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(analytics.unregister_destination(id));
    }

    #[test]
    fn test_calls_before_init_replay_in_order() {
        let storage = StorageBackends::in_memory();
        let analytics = Analytics::builder(PipelineConfig::default())
            .storage(storage)
            .sampler(|| 0.0)
            .build()
            .unwrap();
        analytics.consent().accept_all();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        analytics.register_destination(Arc::new(FnDestination::new("recorder", move |event| {
            sink.lock().push(event.name().to_string());
            Ok(())
        })));

        assert!(analytics.page("home", Properties::new()));
        assert!(analytics.track("signup_start", Properties::new(), TrackOptions::default()));
        assert!(seen.lock().is_empty());

        analytics.init();
        assert_eq!(*seen.lock(), vec!["home", "signup_start"]);
    }

    #[test]
    fn test_pre_init_queue_drops_oldest() {
        let mut config = PipelineConfig::default();
        config.max_queued_calls = 2;
        let analytics = Analytics::builder(config)
            .storage(StorageBackends::in_memory())
            .sampler(|| 0.0)
            .build()
            .unwrap();
        analytics.consent().accept_all();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        analytics.register_destination(Arc::new(FnDestination::new("recorder", move |event| {
            sink.lock().push(event.name().to_string());
            Ok(())
        })));

        for name in ["first", "second", "third"] {
            analytics.page(name, Properties::new());
        }
        analytics.init();

        assert_eq!(*seen.lock(), vec!["second", "third"]);
    }

    #[test]
    fn test_invalid_events_are_rejected() {
        let (analytics, _) = analytics();
        analytics.consent().accept_all();

        assert!(!analytics.track("Bad Name", Properties::new(), TrackOptions::default()));
        let negative = props(&[("value", json!(-5))]);
        assert!(!analytics.conversion("refund", "r-1", negative));
        // a rejected conversion does not burn its idempotency key
        assert!(analytics.conversion("refund", "r-1", Properties::new()));
    }

    #[test]
    fn test_events_carry_standard_properties() {
        let (analytics, _) = analytics();
        analytics.consent().accept_all();
        analytics.set_client_context(ClientContext {
            viewport_width: Some(390),
            locale: Some("de-DE".into()),
            timezone: Some("Europe/Berlin".into()),
        });
        analytics.navigate(
            "https://example.com/landing?utm_source=google&gclid=g1",
            Some("Landing".into()),
        );
        analytics.navigate("https://example.com/pricing", Some("Pricing".into()));

        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        analytics.register_destination(Arc::new(FnDestination::new("capture", move |event| {
            sink.lock().push(event.clone());
            Ok(())
        })));

        analytics.page("pricing", Properties::new());
        analytics.track("cta_click", Properties::new(), TrackOptions::default());

        let events = captured.lock();
        let page = &events[0];
        assert_eq!(page.standard.utm.utm_source.as_deref(), Some("google"));
        assert_eq!(page.standard.utm.gclid.as_deref(), Some("g1"));
        assert_eq!(page.standard.device_class, DeviceClass::Mobile);
        assert_eq!(page.standard.locale, "de-DE");
        assert_eq!(page.standard.page_path.as_deref(), Some("/pricing"));
        assert!(matches!(
            &page.payload,
            EventPayload::PageView { previous_page: Some(prev), .. } if prev == "/landing"
        ));
        assert_eq!(page.standard.anonymous_id, events[1].standard.anonymous_id);
        assert!(events[1].standard.client_timestamp_ms > page.standard.client_timestamp_ms);
    }

    fn export_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.export.enabled = true;
        config.export.endpoint = Some("http://collector.test/v1/batch".into());
        config.export.use_beacon = false;
        config
    }

    #[tokio::test]
    async fn test_only_conversions_export_by_default() {
        let mut transport = MockBatchTransport::new();
        transport.expect_name().return_const("mock");
        transport
            .expect_send()
            .times(1)
            .withf(|batch| batch.len() == 1 && batch.events[0].event_id == "order-9")
            .returning(|_| Ok(()));

        let analytics = Analytics::builder(export_config())
            .storage(StorageBackends::in_memory())
            .transport(Arc::new(transport))
            .sampler(|| 0.0)
            .build()
            .unwrap();
        analytics.init();
        analytics.consent().accept_all();

        analytics.page("home", Properties::new());
        analytics.conversion("purchase", "order-9", Properties::new());

        assert!(matches!(
            analytics.flush().await,
            FlushOutcome::Delivered { events: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_export_destination_opts_in_tracks() {
        let mut transport = MockBatchTransport::new();
        transport.expect_name().return_const("mock");
        transport
            .expect_send()
            .times(1)
            .withf(|batch| batch.len() == 2)
            .returning(|_| Ok(()));

        let analytics = Analytics::builder(export_config())
            .storage(StorageBackends::in_memory())
            .transport(Arc::new(transport))
            .sampler(|| 0.0)
            .build()
            .unwrap();
        analytics.init();
        analytics.consent().accept_all();
        analytics.register_export_destination().unwrap();

        analytics.page("home", Properties::new());
        analytics.conversion("purchase", "order-1", Properties::new());

        analytics.flush().await;
    }

    #[tokio::test]
    async fn test_withdrawal_flushes_then_disables_export() {
        let mut transport = MockBatchTransport::new();
        transport.expect_name().return_const("mock");
        transport.expect_send().times(1).returning(|_| Ok(()));

        let analytics = Analytics::builder(export_config())
            .storage(StorageBackends::in_memory())
            .transport(Arc::new(transport))
            .sampler(|| 0.0)
            .build()
            .unwrap();
        analytics.init();
        analytics.consent().accept_all();
        analytics.conversion("purchase", "order-1", Properties::new());

        analytics.consent().withdraw();
        analytics.join_pending().await;

        let export = analytics.export().unwrap();
        assert!(!export.is_enabled());
        assert_eq!(export.buffer_size(), 0);

        analytics.consent().accept_all();
        assert!(export.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_never_reaches_caller() {
        let mut transport = MockBatchTransport::new();
        transport.expect_name().return_const("mock");
        transport
            .expect_send()
            .returning(|_| Err(TransportError::Status(502)));

        let mut config = export_config();
        config.export.batch_size = 1;
        let analytics = Analytics::builder(config)
            .storage(StorageBackends::in_memory())
            .transport(Arc::new(transport))
            .sampler(|| 0.0)
            .build()
            .unwrap();
        analytics.init();
        analytics.consent().accept_all();

        assert!(analytics.conversion("purchase", "order-1", Properties::new()));
        analytics.join_pending().await;

        assert_eq!(analytics.export().unwrap().failed_batches().len(), 1);
    }
}
