use crate::{KeyValueStore, MemoryStore, StorageError};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const PERSISTENCE_UNKNOWN: u8 = 0;
const PERSISTENCE_YES: u8 = 1;
const PERSISTENCE_NO: u8 = 2;

struct Layer {
    store: Arc<dyn KeyValueStore>,
    degraded: AtomicBool,
}

/// Ordered chain of backends that never surfaces an error.
///
/// Reads return the first hit walking the layers in order; writes land in the
/// first layer that accepts them and clear the key from the layers above.
/// When every layer fails, an internal `MemoryStore` takes over so the value
/// still lives for the process lifetime. Each layer logs a warning on its
/// first failure only.
///
/// A layer that rejects both the write and the cleanup would still serve its
/// old value, so the key is pinned: reads skip straight to the layer holding
/// the newest value.
pub struct LayeredStore {
    layers: Vec<Layer>,
    fallback: MemoryStore,
    /// First layer to read per key; `layers.len()` is the fallback, anything
    /// past it means removed
    pinned: Mutex<HashMap<String, usize>>,
    persistence: AtomicU8,
}

impl LayeredStore {
    pub fn new(layers: Vec<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            layers: layers
                .into_iter()
                .map(|store| Layer {
                    store,
                    degraded: AtomicBool::new(false),
                })
                .collect(),
            fallback: MemoryStore::new(),
            pinned: Mutex::new(HashMap::new()),
            persistence: AtomicU8::new(PERSISTENCE_UNKNOWN),
        }
    }

    /// No backends at all; values live in process memory only
    pub fn memory_only() -> Self {
        Self::new(Vec::new())
    }

    fn note_failure(&self, layer: &Layer, op: &'static str, key: &str, error: &StorageError) {
        if layer.store.is_durable() {
            self.persistence.store(PERSISTENCE_UNKNOWN, Ordering::Relaxed);
        }
        if layer.degraded.swap(true, Ordering::Relaxed) {
            debug!(backend = layer.store.name(), op, key, error = %error, "Storage layer failed");
        } else {
            warn!(
                backend = layer.store.name(),
                op,
                key,
                error = %error,
                "Storage layer failed, falling back"
            );
        }
    }

    /// Remove `key` from `layers[..end]`; false if any of them kept it
    fn clear_above(&self, key: &str, end: usize) -> bool {
        let mut cleared = true;
        for layer in &self.layers[..end] {
            if let Err(e) = layer.store.remove(key) {
                self.note_failure(layer, "remove", key, &e);
                cleared = false;
            }
        }
        cleared
    }

    fn pin(&self, key: &str, start: Option<usize>) {
        let mut pinned = self.pinned.lock();
        match start {
            Some(start) => {
                debug!(key, layer = start, "Pinning key below a stale layer");
                pinned.insert(key.to_string(), start);
            }
            None => {
                pinned.remove(key);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let start = self.pinned.lock().get(key).copied().unwrap_or(0);
        if start > self.layers.len() {
            return None;
        }

        for layer in &self.layers[start..] {
            match layer.store.get(key) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => self.note_failure(layer, "get", key, &e),
            }
        }
        self.fallback.get(key).ok().flatten()
    }

    /// Returns `true` when the value reached a durable backend
    pub fn set(&self, key: &str, value: &str) -> bool {
        for (index, layer) in self.layers.iter().enumerate() {
            match layer.store.set(key, value) {
                Ok(()) => {
                    let _ = self.fallback.remove(key);
                    let cleared = self.clear_above(key, index);
                    self.pin(key, (!cleared).then_some(index));

                    let durable = layer.store.is_durable();
                    if durable {
                        self.persistence.store(PERSISTENCE_YES, Ordering::Relaxed);
                    }
                    return durable;
                }
                Err(e) => self.note_failure(layer, "set", key, &e),
            }
        }
        // MemoryStore without a quota cannot fail
        let _ = self.fallback.set(key, value);
        let cleared = self.clear_above(key, self.layers.len());
        self.pin(key, (!cleared).then_some(self.layers.len()));
        false
    }

    /// Delete the key from every layer
    pub fn remove(&self, key: &str) {
        let cleared = self.clear_above(key, self.layers.len());
        let _ = self.fallback.remove(key);
        self.pin(key, (!cleared).then_some(self.layers.len() + 1));
    }

    pub fn remove_all<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        for key in keys {
            self.remove(key);
        }
    }

    /// Union of keys across all reachable layers, minus removed ones
    pub fn keys(&self) -> Vec<String> {
        let mut all = BTreeSet::new();
        for layer in &self.layers {
            match layer.store.keys() {
                Ok(keys) => all.extend(keys),
                Err(e) => self.note_failure(layer, "keys", "*", &e),
            }
        }
        if let Ok(keys) = self.fallback.keys() {
            all.extend(keys);
        }
        let removed_below = self.layers.len();
        let pinned = self.pinned.lock();
        all.into_iter()
            .filter(|key| pinned.get(key).map_or(true, |start| *start <= removed_below))
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Decode a JSON value; corrupted data reads as absent
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Discarding corrupted stored value");
                None
            }
        }
    }

    /// Encode and write a JSON value; returns `true` when durably stored
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw),
            Err(e) => {
                warn!(key, error = %e, "Failed to encode value for storage");
                false
            }
        }
    }

    /// Whether some durable layer currently accepts writes.
    ///
    /// The answer is cached; a durable write refreshes it and any durable
    /// layer failure forces a new probe.
    pub fn is_persistent(&self) -> bool {
        match self.persistence.load(Ordering::Relaxed) {
            PERSISTENCE_YES => return true,
            PERSISTENCE_NO => return false,
            _ => {}
        }

        let persistent = self
            .layers
            .iter()
            .filter(|layer| layer.store.is_durable())
            .any(|layer| match layer.store.probe() {
                Ok(()) => true,
                Err(e) => {
                    self.note_failure(layer, "probe", crate::PROBE_KEY, &e);
                    false
                }
            });

        let state = if persistent { PERSISTENCE_YES } else { PERSISTENCE_NO };
        self.persistence.store(state, Ordering::Relaxed);
        persistent
    }
}

impl std::fmt::Debug for LayeredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.layers.iter().map(|l| l.store.name()).collect();
        f.debug_struct("LayeredStore").field("layers", &names).finish()
    }
}
