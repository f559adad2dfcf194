//! Persisted upstream session storage.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use flowbridge_core::StoredSession;

use crate::run_store::StoreError;

/// Session store abstraction, keyed by service name so several upstream
/// channels could share one table.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, service: &str) -> Result<Option<StoredSession>, StoreError>;

    async fn save(&self, service: &str, session: &StoredSession) -> Result<(), StoreError>;

    async fn clear(&self, service: &str) -> Result<(), StoreError>;
}

/// In-memory session store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, service: &str) -> Result<Option<StoredSession>, StoreError> {
        Ok(self.sessions.read().unwrap().get(service).cloned())
    }

    async fn save(&self, service: &str, session: &StoredSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .unwrap()
            .insert(service.to_string(), session.clone());
        Ok(())
    }

    async fn clear(&self, service: &str) -> Result<(), StoreError> {
        self.sessions.write().unwrap().remove(service);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use flowbridge_core::Credential;

    #[tokio::test]
    async fn save_load_clear() {
        let store = InMemorySessionStore::new();
        assert!(store.load("upstream").await.unwrap().is_none());

        let session = StoredSession::new(
            Credential::ApiKey("k".to_string()),
            Utc::now() + Duration::hours(22),
        );
        store.save("upstream", &session).await.unwrap();
        assert_eq!(store.load("upstream").await.unwrap(), Some(session));

        store.clear("upstream").await.unwrap();
        assert!(store.load("upstream").await.unwrap().is_none());
    }
}
