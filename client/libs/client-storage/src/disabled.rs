use crate::{KeyValueStore, StorageError, StorageResult};

/// A backend that rejects every operation, as browsers do for storage in
/// private or sandboxed contexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStore;

impl DisabledStore {
    fn denied<T>(&self) -> StorageResult<T> {
        Err(StorageError::Unavailable("storage access denied".to_string()))
    }
}

impl KeyValueStore for DisabledStore {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn get(&self, _key: &str) -> StorageResult<Option<String>> {
        self.denied()
    }

    fn set(&self, _key: &str, _value: &str) -> StorageResult<()> {
        self.denied()
    }

    fn remove(&self, _key: &str) -> StorageResult<()> {
        self.denied()
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        self.denied()
    }
}
