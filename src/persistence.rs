//! Optional persistent session backend (§6). Out of scope to implement a
//! real durable store — the coordinator does not guarantee durability
//! across a crash unless one is plugged in — but the trait and on-disk
//! record shape are specified so a concrete backend can be added later
//! without touching `SessionStore`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSignature {
    pub public_key: String,
    pub signature_base64: String,
    pub participant_id: String,
}

/// Mirrors §3 exactly: `frozen_transaction` as base64, `signatures` as a
/// list (not a map — on-disk records don't need map semantics, just
/// enough to reconstruct the in-memory `Session` on load).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session_id: String,
    pub auth_token: String,
    pub threshold: u32,
    pub eligible_keys: Vec<String>,
    pub expected_participants: u32,
    pub frozen_transaction_base64: Option<String>,
    pub signatures: Vec<PersistedSignature>,
    pub status: String,
    pub created_at_unix: i64,
    pub expires_at_unix: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn put(&self, session: &PersistedSession) -> Result<(), PersistenceError>;
    async fn get(&self, session_id: &str) -> Result<Option<PersistedSession>, PersistenceError>;
    async fn delete(&self, session_id: &str) -> Result<(), PersistenceError>;
}

/// Reference implementation used in tests; not durable across a process
/// restart, so never appropriate as the production backend.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, PersistedSession>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn put(&self, session: &PersistedSession) -> Result<(), PersistenceError> {
        self.records.lock().expect("in-memory store poisoned").insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<PersistedSession>, PersistenceError> {
        Ok(self.records.lock().expect("in-memory store poisoned").get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<(), PersistenceError> {
        self.records.lock().expect("in-memory store poisoned").remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_record() {
        let store = InMemoryStore::new();
        let record = PersistedSession {
            session_id: "abc".into(),
            auth_token: "secret".into(),
            threshold: 2,
            eligible_keys: vec!["k1".into(), "k2".into()],
            expected_participants: 2,
            frozen_transaction_base64: None,
            signatures: vec![],
            status: "waiting".into(),
            created_at_unix: 0,
            expires_at_unix: 1800,
        };
        store.put(&record).await.unwrap();
        let fetched = store.get("abc").await.unwrap().unwrap();
        assert_eq!(fetched.session_id, "abc");
        store.delete("abc").await.unwrap();
        assert!(store.get("abc").await.unwrap().is_none());
    }
}
