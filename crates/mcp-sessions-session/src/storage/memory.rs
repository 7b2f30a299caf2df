//! In-memory session storage.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use mcp_sessions_core::record::{SessionId, SessionRecord};
use mcp_sessions_core::store::{SessionStore, StoreError};

struct Entry {
    record: SessionRecord,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments. Data is lost on
/// restart; the registry treats that exactly like a first run.
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, Entry>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err<T>(err: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let expired = {
            let sessions = self.sessions.read().map_err(lock_err)?;
            match sessions.get(&id) {
                Some(entry) if entry.is_live() => return Ok(Some(entry.record.clone())),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.sessions.write().map_err(lock_err)?.remove(&id);
        }
        Ok(None)
    }

    async fn insert(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(lock_err)?;
        if sessions
            .get(&record.session_id)
            .is_some_and(Entry::is_live)
        {
            return Err(StoreError::Conflict(record.session_id));
        }
        sessions.insert(
            record.session_id,
            Entry {
                record: record.clone(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn update(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.sessions.write().map_err(lock_err)?.insert(
            record.session_id,
            Entry {
                record: record.clone(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, id: SessionId) -> Result<(), StoreError> {
        self.sessions.write().map_err(lock_err)?.remove(&id);
        Ok(())
    }

    async fn list_by_identity(&self, identity: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut sessions = self.sessions.write().map_err(lock_err)?;
        sessions.retain(|_, entry| entry.is_live());
        let mut result: Vec<SessionRecord> = sessions
            .values()
            .filter(|entry| entry.record.identity == identity)
            .map(|entry| entry.record.clone())
            .collect();
        result.sort_by(|a, b| a.last_activity.cmp(&b.last_activity));
        Ok(result)
    }
}
