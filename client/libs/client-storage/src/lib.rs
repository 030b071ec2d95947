//! Client-side key-value storage
//!
//! Provides the persistence primitives the analytics pipeline builds on:
//! - A synchronous `KeyValueStore` trait (string keys, string values)
//! - `MemoryStore`: process-lifetime storage with an optional byte quota
//! - `FileStore`: durable JSON-file storage that survives restarts
//! - `DisabledStore`: a backend that rejects every call
//! - `LayeredStore`: tries each backend in order and degrades to memory, so
//!   callers never see a storage error

mod disabled;
mod error;
mod file;
mod layered;
mod memory;

pub use disabled::DisabledStore;
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use layered::LayeredStore;
pub use memory::MemoryStore;

use serde::{de::DeserializeOwned, Serialize};

/// Key used to test whether a backend accepts writes
pub const PROBE_KEY: &str = "__storage_probe__";

/// Core storage operations trait
pub trait KeyValueStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Get a raw value
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Set a raw value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Delete a key; deleting a missing key is not an error
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// All keys currently stored
    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Whether values outlive the current process
    fn is_durable(&self) -> bool {
        true
    }

    /// Write-then-delete probe
    fn probe(&self) -> StorageResult<()> {
        self.set(PROBE_KEY, "1")?;
        self.remove(PROBE_KEY)
    }
}

/// Read and decode a JSON value
pub fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> StorageResult<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub fn set_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}
