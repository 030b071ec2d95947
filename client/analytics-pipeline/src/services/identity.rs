use crate::config::IdentityConfig;
use crate::storage::StorageBackends;
use crate::storage_keys;
use chrono::{DateTime, Utc};
use client_storage::LayeredStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifiers attached to every event. Random, carrying no personal data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymousIdentity {
    pub anonymous_id: String,
    pub session_id: String,
    pub anonymous_id_created_at: DateTime<Utc>,
    pub session_started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// False when storage is blocked and the ids only live in memory
    pub is_persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredAnonymousId {
    id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredSession {
    id: String,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    /// UTC calendar day the session started on
    day_key: String,
}

fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Anonymous id and session lifecycle
pub struct IdentityManager {
    durable: Arc<LayeredStore>,
    config: IdentityConfig,
    ephemeral: Mutex<Option<(StoredAnonymousId, StoredSession)>>,
}

impl IdentityManager {
    pub fn new(storage: &StorageBackends, config: IdentityConfig) -> Self {
        Self {
            durable: storage.durable.clone(),
            config,
            ephemeral: Mutex::new(None),
        }
    }

    pub fn get_identity(&self) -> AnonymousIdentity {
        self.get_identity_at(Utc::now())
    }

    /// Load, rotate as needed, and persist the current identity
    pub fn get_identity_at(&self, now: DateTime<Utc>) -> AnonymousIdentity {
        let anonymous = self
            .durable
            .get_json::<StoredAnonymousId>(storage_keys::ANONYMOUS_ID);
        let session = self.durable.get_json::<StoredSession>(storage_keys::SESSION);

        let (anonymous, session) = self.advance(anonymous, session, now);

        let persisted = self.durable.set_json(storage_keys::ANONYMOUS_ID, &anonymous)
            & self.durable.set_json(storage_keys::SESSION, &session);

        build(&anonymous, &session, persisted)
    }

    pub fn get_identity_with_fallback(&self) -> AnonymousIdentity {
        self.get_identity_with_fallback_at(Utc::now())
    }

    /// Like `get_identity_at`, but when no durable layer accepts writes the
    /// identity is kept in memory for this instance and flagged as not
    /// persisted.
    pub fn get_identity_with_fallback_at(&self, now: DateTime<Utc>) -> AnonymousIdentity {
        if self.durable.is_persistent() {
            return self.get_identity_at(now);
        }

        let mut cache = self.ephemeral.lock();
        let (anonymous, session) = match cache.take() {
            Some((anonymous, session)) => self.advance(Some(anonymous), Some(session), now),
            None => {
                warn!("Storage blocked, using ephemeral identifiers");
                self.advance(None, None, now)
            }
        };
        let identity = build(&anonymous, &session, false);
        *cache = Some((anonymous, session));
        identity
    }

    /// Forget in-memory identifiers
    pub fn clear_cache(&self) {
        *self.ephemeral.lock() = None;
    }

    fn advance(
        &self,
        anonymous: Option<StoredAnonymousId>,
        session: Option<StoredSession>,
        now: DateTime<Utc>,
    ) -> (StoredAnonymousId, StoredSession) {
        let anonymous = match anonymous {
            Some(stored) if stored.expires_at > now => stored,
            expired => {
                if expired.is_some() {
                    debug!("Anonymous id expired, regenerating");
                }
                StoredAnonymousId {
                    id: Uuid::new_v4().to_string(),
                    created_at: now,
                    expires_at: now + self.config.anonymous_id_expiry(),
                }
            }
        };

        let today = day_key(now);
        let session = match session {
            Some(mut stored) if !self.session_expired(&stored, now, &today) => {
                stored.last_activity_at = now;
                stored
            }
            previous => {
                if previous.is_some() {
                    debug!("Session expired, starting a new one");
                }
                StoredSession {
                    id: Uuid::new_v4().to_string(),
                    started_at: now,
                    last_activity_at: now,
                    day_key: today,
                }
            }
        };

        (anonymous, session)
    }

    fn session_expired(&self, session: &StoredSession, now: DateTime<Utc>, today: &str) -> bool {
        if now - session.last_activity_at > self.config.session_timeout() {
            return true;
        }
        self.config.reset_session_daily && session.day_key != today
    }
}

fn build(anonymous: &StoredAnonymousId, session: &StoredSession, is_persisted: bool) -> AnonymousIdentity {
    AnonymousIdentity {
        anonymous_id: anonymous.id.clone(),
        session_id: session.id.clone(),
        anonymous_id_created_at: anonymous.created_at,
        session_started_at: session.started_at,
        last_activity_at: session.last_activity_at,
        is_persisted,
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use client_storage::{DisabledStore, KeyValueStore, MemoryStore};

    /// Memory-backed durable store that still reports itself as persistent
    struct DurableMemory(MemoryStore);

    impl KeyValueStore for DurableMemory {
        fn name(&self) -> &'static str {
            "durable-memory"
        }
        fn get(&self, key: &str) -> client_storage::StorageResult<Option<String>> {
            self.0.get(key)
        }
        fn set(&self, key: &str, value: &str) -> client_storage::StorageResult<()> {
            self.0.set(key, value)
        }
        fn remove(&self, key: &str) -> client_storage::StorageResult<()> {
            self.0.remove(key)
        }
        fn keys(&self) -> client_storage::StorageResult<Vec<String>> {
            self.0.keys()
        }
    }

    fn persistent_storage() -> StorageBackends {
        let layers: Vec<Arc<dyn KeyValueStore>> =
            vec![Arc::new(DurableMemory(MemoryStore::new()))];
        StorageBackends::new(LayeredStore::new(layers), LayeredStore::memory_only())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_identity_is_stable_within_session() {
        let manager = IdentityManager::new(&persistent_storage(), IdentityConfig::default());

        let first = manager.get_identity_at(t0());
        let second = manager.get_identity_at(t0() + Duration::minutes(10));

        assert_eq!(first.anonymous_id, second.anonymous_id);
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(second.last_activity_at, t0() + Duration::minutes(10));
        assert_eq!(second.session_started_at, t0());
        assert!(second.is_persisted);
    }

    #[test]
    fn test_session_rotates_after_inactivity() {
        let manager = IdentityManager::new(&persistent_storage(), IdentityConfig::default());

        let first = manager.get_identity_at(t0());
        let later = manager.get_identity_at(t0() + Duration::minutes(31));

        assert_eq!(first.anonymous_id, later.anonymous_id);
        assert_ne!(first.session_id, later.session_id);
    }

    #[test]
    fn test_activity_keeps_session_alive() {
        let manager = IdentityManager::new(&persistent_storage(), IdentityConfig::default());

        let first = manager.get_identity_at(t0());
        manager.get_identity_at(t0() + Duration::minutes(25));
        let later = manager.get_identity_at(t0() + Duration::minutes(50));

        assert_eq!(first.session_id, later.session_id);
    }

    #[test]
    fn test_daily_reset() {
        let config = IdentityConfig {
            reset_session_daily: true,
            ..Default::default()
        };
        let manager = IdentityManager::new(&persistent_storage(), config);
        let late = Utc.with_ymd_and_hms(2024, 3, 10, 23, 55, 0).unwrap();

        let before = manager.get_identity_at(late);
        let after = manager.get_identity_at(late + Duration::minutes(10));

        assert_ne!(before.session_id, after.session_id);
    }

    #[test]
    fn test_anonymous_id_expires() {
        let manager = IdentityManager::new(&persistent_storage(), IdentityConfig::default());

        let first = manager.get_identity_at(t0());
        let year_later = manager.get_identity_at(t0() + Duration::days(366));

        assert_ne!(first.anonymous_id, year_later.anonymous_id);
        assert_eq!(year_later.anonymous_id_created_at, t0() + Duration::days(366));
    }

    #[test]
    fn test_fallback_when_storage_blocked() {
        let layers: Vec<Arc<dyn KeyValueStore>> = vec![Arc::new(DisabledStore)];
        let storage = StorageBackends::new(LayeredStore::new(layers), LayeredStore::memory_only());
        let manager = IdentityManager::new(&storage, IdentityConfig::default());

        let first = manager.get_identity_with_fallback_at(t0());
        let second = manager.get_identity_with_fallback_at(t0() + Duration::minutes(1));

        assert!(!first.is_persisted);
        assert!(!first.anonymous_id.is_empty());
        assert_eq!(first.anonymous_id, second.anonymous_id);
        assert_eq!(first.session_id, second.session_id);

        manager.clear_cache();
        let third = manager.get_identity_with_fallback_at(t0() + Duration::minutes(2));
        assert_ne!(first.anonymous_id, third.anonymous_id);
    }

    #[test]
    fn test_fallback_uses_storage_when_available() {
        let manager = IdentityManager::new(&persistent_storage(), IdentityConfig::default());

        let identity = manager.get_identity_with_fallback_at(t0());

        assert!(identity.is_persisted);
        assert_eq!(identity.anonymous_id, manager.get_identity_at(t0()).anonymous_id);
    }
}
