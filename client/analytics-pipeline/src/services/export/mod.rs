//! Export buffer and the transports it delivers through

mod buffer;
mod transport;

pub use buffer::{ExportBuffer, FlushOutcome};
pub use transport::{BatchTransport, BeaconTransport, HttpTransport};

#[cfg(test)]
pub use transport::MockBatchTransport;

use crate::config::ExportConfig;
use crate::error::{PipelineError, PipelineResult};
use std::sync::Arc;

/// Build the HTTP and beacon transports for `config.endpoint`
pub fn transports_from_config(
    config: &ExportConfig,
) -> PipelineResult<(Arc<dyn BatchTransport>, Arc<dyn BatchTransport>)> {
    let endpoint = config
        .endpoint
        .clone()
        .ok_or_else(|| PipelineError::Config("export endpoint is not configured".to_string()))?;

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(crate::error::TransportError::from)?;

    let reliable: Arc<dyn BatchTransport> = Arc::new(HttpTransport::new(
        client.clone(),
        endpoint.clone(),
        config.request_timeout(),
    ));
    let beacon: Arc<dyn BatchTransport> = Arc::new(BeaconTransport::new(
        client,
        endpoint,
        config.beacon_max_bytes,
        config.request_timeout(),
    ));

    Ok((reliable, beacon))
}
