use super::transport::BatchTransport;
use crate::config::ExportConfig;
use crate::error::TransportError;
use crate::metrics::PipelineMetrics;
use crate::services::consent::{ConsentCategory, ConsentStore};
use crate::storage::StorageBackends;
use crate::storage_keys;
use client_storage::LayeredStore;
use event_schema::{transform_event_for_export, AnalyticsEvent, ExportBatch, ExportEvent};
use parking_lot::Mutex;
use resilience::{with_backoff_when, BackoffPolicy, RetryError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a flush did with the buffered events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered
    Empty,
    Delivered { batch_id: Uuid, events: usize },
    /// Retries ran out; the batch waits in the failed-batch store
    Persisted { batch_id: Uuid },
    /// The endpoint refused the batch outright, or consent is gone
    Dropped { batch_id: Uuid },
}

/// Batches events for the collection endpoint.
///
/// Cheap to clone; clones share one buffer.
#[derive(Clone)]
pub struct ExportBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    config: ExportConfig,
    source: String,
    consent: Arc<ConsentStore>,
    durable: Arc<LayeredStore>,
    reliable: Arc<dyn BatchTransport>,
    beacon: Option<Arc<dyn BatchTransport>>,
    metrics: PipelineMetrics,
    policy: BackoffPolicy,
    events: Mutex<Vec<ExportEvent>>,
    enabled: AtomicBool,
    pending: Mutex<Vec<JoinHandle<()>>>,
    // serializes read-modify-write of the failed-batch list
    failed_store: tokio::sync::Mutex<()>,
}

impl ExportBuffer {
    pub fn new(
        config: ExportConfig,
        source: impl Into<String>,
        consent: Arc<ConsentStore>,
        storage: &StorageBackends,
        reliable: Arc<dyn BatchTransport>,
        metrics: PipelineMetrics,
    ) -> Self {
        let policy = BackoffPolicy::new(config.max_retries, config.retry_base_delay());
        let enabled = config.enabled;

        Self {
            inner: Arc::new(Inner {
                config,
                source: source.into(),
                consent,
                durable: storage.durable.clone(),
                reliable,
                beacon: None,
                metrics,
                policy,
                events: Mutex::new(Vec::new()),
                enabled: AtomicBool::new(enabled),
                pending: Mutex::new(Vec::new()),
                failed_store: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Try `beacon` first when `use_beacon` is set. Must be called before the
    /// buffer is cloned.
    pub fn with_beacon(mut self, beacon: Arc<dyn BatchTransport>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.beacon = Some(beacon),
            None => warn!("Export buffer already shared, beacon transport ignored"),
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
        info!("Export enabled");
    }

    /// Add an event; returns false when export is off or consent is missing.
    ///
    /// Reaching `batch_size` schedules a flush on the current runtime.
    pub fn buffer_event(&self, event: &AnalyticsEvent) -> bool {
        if !self.is_enabled() || !self.inner.consent.can_track(ConsentCategory::Analytics) {
            return false;
        }

        let size = {
            let mut events = self.inner.events.lock();
            events.push(transform_event_for_export(event));
            events.len()
        };
        self.inner.metrics.export_buffer_size.set(size as i64);

        if size >= self.inner.config.batch_size {
            debug!(size, "Batch size reached, flushing");
            self.schedule_flush();
        }
        true
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.events.lock().len()
    }

    /// Page hidden or unloading: push out whatever is buffered
    pub fn on_page_hide(&self) {
        if self.buffer_size() > 0 {
            self.schedule_flush();
        }
    }

    /// Send everything buffered as one batch.
    ///
    /// Events buffered while the batch is in flight start a fresh buffer.
    pub async fn flush_events(&self) -> FlushOutcome {
        let events = self.take_events();
        if events.is_empty() {
            return FlushOutcome::Empty;
        }

        let outcome = self.send_batch(ExportBatch::new(&self.inner.source, events)).await;

        let delivered = matches!(outcome, FlushOutcome::Delivered { .. });
        if delivered && self.inner.config.replay_failed_on_success {
            self.retry_failed_batches().await;
        }
        outcome
    }

    /// Resend persisted batches once each, removing the ones delivered.
    ///
    /// Unreadable entries are discarded. Returns the number delivered.
    pub async fn retry_failed_batches(&self) -> usize {
        if !self.inner.consent.can_track(ConsentCategory::Analytics) {
            return 0;
        }

        let _guard = self.inner.failed_store.lock().await;
        let stored = self.load_failed();
        if stored.is_empty() {
            // drops the key if it only held unreadable entries
            self.store_failed(&stored);
            return 0;
        }

        let mut delivered = 0;
        let mut remaining = Vec::with_capacity(stored.len());
        for mut batch in stored {
            match self.inner.reliable.send(&batch).await {
                Ok(()) => {
                    info!(batch_id = %batch.batch_id, events = batch.len(), "Replayed failed batch");
                    self.inner.metrics.batches_sent.inc();
                    delivered += 1;
                }
                Err(e) => {
                    debug!(batch_id = %batch.batch_id, error = %e, "Replay failed, keeping batch");
                    batch.mark_failed(e.to_string());
                    remaining.push(batch);
                }
            }
        }

        self.store_failed(&remaining);
        delivered
    }

    /// Flush what is buffered, then stop accepting events.
    ///
    /// The final batch goes out in the background. If it fails after consent
    /// is gone it is discarded rather than persisted.
    pub fn flush_then_disable(&self) {
        let events = self.take_events();
        self.inner.enabled.store(false, Ordering::SeqCst);
        info!(pending = events.len(), "Export disabled");

        if events.is_empty() {
            return;
        }
        let batch = ExportBatch::new(&self.inner.source, events);
        let this = self.clone();
        self.spawn(async move {
            this.send_batch(batch).await;
        });
    }

    /// Wait for every background flush, including ones they schedule
    pub async fn join_pending(&self) {
        loop {
            let handles = std::mem::take(&mut *self.inner.pending.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Background flush task failed");
                }
            }
        }
    }

    fn take_events(&self) -> Vec<ExportEvent> {
        let events = std::mem::take(&mut *self.inner.events.lock());
        self.inner.metrics.export_buffer_size.set(0);
        events
    }

    fn schedule_flush(&self) {
        let this = self.clone();
        self.spawn(async move {
            this.flush_events().await;
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(task);
                let mut pending = self.inner.pending.lock();
                pending.retain(|h| !h.is_finished());
                pending.push(handle);
            }
            Err(_) => warn!("No async runtime, events stay buffered until the next flush"),
        }
    }

    async fn send_batch(&self, mut batch: ExportBatch) -> FlushOutcome {
        let batch_id = batch.batch_id;

        if let Some(beacon) = self.inner.beacon.as_ref().filter(|_| self.inner.config.use_beacon) {
            match beacon.send(&batch).await {
                Ok(()) => return self.delivered(&batch),
                Err(e) => debug!(%batch_id, error = %e, "Beacon unavailable, using request"),
            }
        }

        let result = with_backoff_when(&self.inner.policy, TransportError::is_transient, |_| {
            self.inner.reliable.send(&batch)
        })
        .await;

        match result {
            Ok(()) => self.delivered(&batch),
            Err(RetryError::Permanent { error: e, .. }) => {
                error!(%batch_id, error = %e, events = batch.len(), "Batch rejected, dropping");
                FlushOutcome::Dropped { batch_id }
            }
            Err(e) => {
                batch.mark_failed(e.to_string());
                self.persist_failed(batch).await
            }
        }
    }

    fn delivered(&self, batch: &ExportBatch) -> FlushOutcome {
        self.inner.metrics.batches_sent.inc();
        FlushOutcome::Delivered {
            batch_id: batch.batch_id,
            events: batch.len(),
        }
    }

    async fn persist_failed(&self, batch: ExportBatch) -> FlushOutcome {
        let batch_id = batch.batch_id;
        if !self.inner.consent.can_track(ConsentCategory::Analytics) {
            warn!(%batch_id, "Consent withdrawn, discarding failed batch");
            return FlushOutcome::Dropped { batch_id };
        }

        let _guard = self.inner.failed_store.lock().await;
        let mut stored = self.load_failed();
        stored.push(batch);

        let max = self.inner.config.max_failed_batches;
        if stored.len() > max {
            let overflow = stored.len() - max;
            warn!(dropped = overflow, "Failed-batch store full, dropping oldest");
            stored.drain(..overflow);
        }

        self.store_failed(&stored);
        self.inner.metrics.batches_persisted.inc();
        warn!(%batch_id, stored = stored.len(), "Batch persisted for replay");
        FlushOutcome::Persisted { batch_id }
    }

    fn load_failed(&self) -> Vec<ExportBatch> {
        let Some(raw) = self.inner.durable.get(storage_keys::FAILED_BATCHES) else {
            return Vec::new();
        };

        let entries: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed-batch store is corrupted, discarding it");
                self.inner.durable.remove(storage_keys::FAILED_BATCHES);
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<ExportBatch>(entry) {
                Ok(batch) => Some(batch),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable failed batch");
                    None
                }
            })
            .collect()
    }

    fn store_failed(&self, batches: &[ExportBatch]) {
        if batches.is_empty() {
            self.inner.durable.remove(storage_keys::FAILED_BATCHES);
        } else {
            self.inner.durable.set_json(storage_keys::FAILED_BATCHES, batches);
        }
    }

    /// Batches currently waiting for replay
    pub fn failed_batches(&self) -> Vec<ExportBatch> {
        self.load_failed()
    }
}

impl std::fmt::Debug for ExportBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportBuffer")
            .field("enabled", &self.is_enabled())
            .field("buffered", &self.buffer_size())
            .field("reliable", &self.inner.reliable.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::export::transport::MockBatchTransport;
    use crate::test_support::{consented, page_view};
    use std::sync::atomic::AtomicUsize;

    fn export_config(batch_size: usize) -> ExportConfig {
        ExportConfig {
            enabled: true,
            endpoint: Some("http://collector.test/v1/batch".into()),
            batch_size,
            use_beacon: false,
            replay_failed_on_success: false,
            ..Default::default()
        }
    }

    fn buffer_with(
        config: ExportConfig,
        storage: &StorageBackends,
        consent: Arc<ConsentStore>,
        transport: MockBatchTransport,
    ) -> ExportBuffer {
        ExportBuffer::new(
            config,
            "web",
            consent,
            storage,
            Arc::new(transport),
            PipelineMetrics::standalone().unwrap(),
        )
    }

    fn succeeding(times: usize) -> MockBatchTransport {
        let mut transport = MockBatchTransport::new();
        transport.expect_name().return_const("mock");
        transport.expect_send().times(times).returning(|_| Ok(()));
        transport
    }

    fn failing(times: usize) -> MockBatchTransport {
        let mut transport = MockBatchTransport::new();
        transport.expect_name().return_const("mock");
        transport
            .expect_send()
            .times(times)
            .returning(|_| Err(TransportError::Status(503)));
        transport
    }

    #[tokio::test]
    async fn test_batch_size_triggers_exactly_one_flush() {
        let (storage, consent) = consented();
        let buffer = buffer_with(export_config(2), &storage, consent, succeeding(1));

        assert!(buffer.buffer_event(&page_view("home")));
        assert!(buffer.buffer_event(&page_view("pricing")));
        buffer.join_pending().await;

        assert_eq!(buffer.buffer_size(), 0);
    }

    #[tokio::test]
    async fn test_disabled_or_unconsented_buffer_is_noop() {
        let storage = StorageBackends::in_memory();
        let consent = Arc::new(ConsentStore::new(&storage));
        let buffer = buffer_with(export_config(10), &storage, consent.clone(), succeeding(0));

        assert!(!buffer.buffer_event(&page_view("home")));

        consent.accept_all();
        let mut config = export_config(10);
        config.enabled = false;
        let disabled = buffer_with(config, &storage, consent, succeeding(0));
        assert!(!disabled.buffer_event(&page_view("home")));
        assert_eq!(disabled.buffer_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_persist_then_replay_removes() {
        let (storage, consent) = consented();
        let buffer = buffer_with(export_config(10), &storage, consent.clone(), failing(3));

        buffer.buffer_event(&page_view("home"));
        let outcome = buffer.flush_events().await;

        let FlushOutcome::Persisted { batch_id } = outcome else {
            panic!("expected persisted batch, got {:?}", outcome);
        };
        let stored = buffer.failed_batches();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].batch_id, batch_id);
        assert_eq!(stored[0].retry_count, 1);

        let recovered = buffer_with(export_config(10), &storage, consent, succeeding(1));
        assert_eq!(recovered.retry_failed_batches().await, 1);
        assert!(!storage.durable.contains(storage_keys::FAILED_BATCHES));
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_not_retried() {
        let (storage, consent) = consented();
        let mut transport = MockBatchTransport::new();
        transport.expect_name().return_const("mock");
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(TransportError::Status(400)));
        let buffer = buffer_with(export_config(10), &storage, consent, transport);

        buffer.buffer_event(&page_view("home"));

        assert!(matches!(
            buffer.flush_events().await,
            FlushOutcome::Dropped { .. }
        ));
        assert!(buffer.failed_batches().is_empty());
    }

    #[tokio::test]
    async fn test_failed_store_is_bounded() {
        let (storage, consent) = consented();
        let mut config = export_config(10);
        config.max_retries = 1;
        config.max_failed_batches = 3;
        let buffer = buffer_with(config, &storage, consent, failing(5));

        for i in 0..5 {
            buffer.buffer_event(&page_view(&format!("page_{}", i)));
            buffer.flush_events().await;
        }

        let stored = buffer.failed_batches();
        assert_eq!(stored.len(), 3);
        assert_eq!(
            stored[0].events[0].properties["page_name"],
            serde_json::json!("page_2")
        );
    }

    #[tokio::test]
    async fn test_replay_tolerates_corrupt_store() {
        let (storage, consent) = consented();
        let buffer = buffer_with(export_config(10), &storage, consent, succeeding(0));

        storage.durable.set(storage_keys::FAILED_BATCHES, "[not json");
        assert_eq!(buffer.retry_failed_batches().await, 0);
        assert!(!storage.durable.contains(storage_keys::FAILED_BATCHES));

        storage
            .durable
            .set(storage_keys::FAILED_BATCHES, r#"[{"garbage":true}]"#);
        assert_eq!(buffer.retry_failed_batches().await, 0);
        assert!(!storage.durable.contains(storage_keys::FAILED_BATCHES));
    }

    #[tokio::test]
    async fn test_successful_flush_replays_stored_batches() {
        let (storage, consent) = consented();
        let mut config = export_config(10);
        config.max_retries = 1;
        let first = buffer_with(config.clone(), &storage, consent.clone(), failing(1));
        first.buffer_event(&page_view("home"));
        first.flush_events().await;
        assert_eq!(first.failed_batches().len(), 1);

        config.replay_failed_on_success = true;
        let second = buffer_with(config, &storage, consent, succeeding(2));
        second.buffer_event(&page_view("pricing"));

        assert!(matches!(
            second.flush_events().await,
            FlushOutcome::Delivered { events: 1, .. }
        ));
        assert!(second.failed_batches().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_beacon_falls_back_to_request() {
        let (storage, consent) = consented();
        let mut beacon = MockBatchTransport::new();
        beacon.expect_name().return_const("beacon");
        beacon
            .expect_send()
            .times(1)
            .returning(|_| Err(TransportError::BeaconRejected("too large".into())));

        let mut config = export_config(10);
        config.use_beacon = true;
        let buffer =
            buffer_with(config, &storage, consent, succeeding(1)).with_beacon(Arc::new(beacon));

        buffer.buffer_event(&page_view("home"));
        assert!(matches!(
            buffer.flush_events().await,
            FlushOutcome::Delivered { .. }
        ));
    }

    #[tokio::test]
    async fn test_flush_then_disable() {
        let (storage, consent) = consented();
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = sent.clone();
        let mut transport = MockBatchTransport::new();
        transport.expect_name().return_const("mock");
        transport.expect_send().returning(move |batch| {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        });
        let buffer = buffer_with(export_config(10), &storage, consent, transport);

        buffer.buffer_event(&page_view("home"));
        buffer.buffer_event(&page_view("pricing"));
        buffer.flush_then_disable();
        buffer.join_pending().await;

        assert_eq!(sent.load(Ordering::SeqCst), 2);
        assert!(!buffer.buffer_event(&page_view("docs")));

        buffer.enable();
        assert!(buffer.buffer_event(&page_view("docs")));
    }

    #[tokio::test]
    async fn test_page_hide_flushes() {
        let (storage, consent) = consented();
        let buffer = buffer_with(export_config(10), &storage, consent, succeeding(1));

        buffer.on_page_hide();
        buffer.buffer_event(&page_view("home"));
        buffer.on_page_hide();
        buffer.join_pending().await;

        assert_eq!(buffer.buffer_size(), 0);
    }
}
