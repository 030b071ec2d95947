//! Prometheus metrics for the analytics pipeline

use crate::error::PipelineResult;
use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::warn;

#[derive(Clone)]
pub struct PipelineMetrics {
    pub events_admitted: IntCounter,
    pub events_dropped: IntCounterVec,
    pub destination_failures: IntCounter,
    pub batches_sent: IntCounter,
    pub batches_persisted: IntCounter,
    pub export_buffer_size: IntGauge,
    pub sampling_rate: Gauge,
}

impl PipelineMetrics {
    /// Build the metric set and register it on `registry`.
    ///
    /// A metric that is already registered (a second pipeline on the same
    /// registry) is logged and skipped; the handles still work locally.
    pub fn new(registry: &Registry) -> PipelineResult<Self> {
        let metrics = Self {
            events_admitted: IntCounter::new(
                "analytics_events_admitted_total",
                "Events admitted by the cost-control gate",
            )?,
            events_dropped: IntCounterVec::new(
                Opts::new(
                    "analytics_events_dropped_total",
                    "Events dropped before dispatch",
                ),
                &["reason"],
            )?,
            destination_failures: IntCounter::new(
                "analytics_destination_failures_total",
                "Destination handlers that failed or panicked",
            )?,
            batches_sent: IntCounter::new(
                "analytics_batches_sent_total",
                "Export batches delivered to the collection endpoint",
            )?,
            batches_persisted: IntCounter::new(
                "analytics_batches_persisted_total",
                "Export batches moved to the failed-batch store",
            )?,
            export_buffer_size: IntGauge::new(
                "analytics_export_buffer_size",
                "Events waiting in the export buffer",
            )?,
            sampling_rate: Gauge::new(
                "analytics_sampling_rate",
                "Current adaptive sampling rate",
            )?,
        };

        metrics.register(registry);
        Ok(metrics)
    }

    /// Metrics backed by a private registry
    pub fn standalone() -> PipelineResult<Self> {
        Self::new(&Registry::new())
    }

    fn register(&self, registry: &Registry) {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(self.events_admitted.clone()),
            Box::new(self.events_dropped.clone()),
            Box::new(self.destination_failures.clone()),
            Box::new(self.batches_sent.clone()),
            Box::new(self.batches_persisted.clone()),
            Box::new(self.export_buffer_size.clone()),
            Box::new(self.sampling_rate.clone()),
        ];

        for collector in collectors {
            if let Err(e) = registry.register(collector) {
                warn!(error = %e, "Failed to register analytics metric");
            }
        }
    }

    pub fn record_drop(&self, reason: &str) {
        self.events_dropped.with_label_values(&[reason]).inc();
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("events_admitted", &self.events_admitted.get())
            .field("export_buffer_size", &self.export_buffer_size.get())
            .finish()
    }
}
