use crate::config::StorageConfig;
use client_storage::{FileStore, KeyValueStore, LayeredStore, MemoryStore};
use std::sync::Arc;
use tracing::{info, warn};

/// File name of the durable store inside `data_dir`
pub const DURABLE_FILE: &str = "analytics.json";

/// The two stores every component shares.
///
/// `durable` outlives the process when a data directory is configured;
/// `session` lives only as long as the pipeline instance.
#[derive(Debug, Clone)]
pub struct StorageBackends {
    pub durable: Arc<LayeredStore>,
    pub session: Arc<LayeredStore>,
}

impl StorageBackends {
    pub fn new(durable: LayeredStore, session: LayeredStore) -> Self {
        Self {
            durable: Arc::new(durable),
            session: Arc::new(session),
        }
    }

    /// Memory-only stores
    pub fn in_memory() -> Self {
        Self::new(LayeredStore::memory_only(), LayeredStore::memory_only())
    }

    /// File store first, memory second. An unopenable data directory leaves
    /// the pipeline running on memory alone.
    pub fn from_config(config: &StorageConfig) -> Self {
        let Some(dir) = &config.data_dir else {
            return Self::in_memory();
        };

        let path = dir.join(DURABLE_FILE);
        let durable = match FileStore::open(&path) {
            Ok(store) => {
                info!(path = %path.display(), "Using durable analytics store");
                let layers: Vec<Arc<dyn KeyValueStore>> =
                    vec![Arc::new(store), Arc::new(MemoryStore::new())];
                LayeredStore::new(layers)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Durable store unavailable, using memory");
                LayeredStore::memory_only()
            }
        };

        Self::new(durable, LayeredStore::memory_only())
    }
}
