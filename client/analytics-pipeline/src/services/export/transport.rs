use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use event_schema::ExportBatch;
use reqwest::header::CONTENT_TYPE;
use resilience::{with_timeout, with_timeout_result, TimeoutError};
use std::time::Duration;
use tracing::{debug, warn};

/// Delivers one batch to the collection endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, batch: &ExportBatch) -> TransportResult<()>;
}

/// Standard request that waits for the endpoint's answer
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl BatchTransport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, batch: &ExportBatch) -> TransportResult<()> {
        let body = batch.to_json_bytes()?;
        let request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        let result = with_timeout_result(self.timeout, async {
            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(TransportError::Status(status.as_u16()))
            }
        })
        .await;

        match result {
            Ok(()) => {
                debug!(batch_id = %batch.batch_id, events = batch.len(), "Batch delivered");
                Ok(())
            }
            Err(TimeoutError::Elapsed(after)) => Err(TransportError::Timeout(after)),
            Err(TimeoutError::Failed(e)) => Err(e),
        }
    }
}

/// Fire-and-forget delivery.
///
/// `send` returns once the request is queued on the runtime, so the caller is
/// never held up by the network. Oversized payloads are refused up front and
/// the caller is expected to fall back to [`HttpTransport`].
pub struct BeaconTransport {
    client: reqwest::Client,
    endpoint: String,
    max_bytes: usize,
    timeout: Duration,
}

impl BeaconTransport {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        max_bytes: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            max_bytes,
            timeout,
        }
    }
}

#[async_trait]
impl BatchTransport for BeaconTransport {
    fn name(&self) -> &'static str {
        "beacon"
    }

    async fn send(&self, batch: &ExportBatch) -> TransportResult<()> {
        let body = batch.to_json_bytes()?;
        if body.len() > self.max_bytes {
            return Err(TransportError::BeaconRejected(format!(
                "payload of {} bytes exceeds {} byte limit",
                body.len(),
                self.max_bytes
            )));
        }

        let request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let batch_id = batch.batch_id;
        let timeout = self.timeout;

        tokio::spawn(async move {
            match with_timeout(timeout, request.send()).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    debug!(%batch_id, "Beacon delivered");
                }
                Ok(Ok(response)) => {
                    warn!(%batch_id, status = response.status().as_u16(), "Beacon rejected by endpoint");
                }
                Ok(Err(e)) => warn!(%batch_id, error = %e, "Beacon request failed"),
                Err(e) => warn!(%batch_id, error = %e, "Beacon request timed out"),
            }
        });

        Ok(())
    }
}
