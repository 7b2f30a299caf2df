//! Storage backend trait for session records.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{SessionId, SessionRecord};

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A live record already exists for the id. The first writer won.
    #[error("session already exists: {0}")]
    Conflict(SessionId),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Trait for session storage backends.
///
/// All implementations guarantee: writes are atomic per key, reads reflect
/// the latest completed write from this process, and a record whose TTL has
/// elapsed is treated as absent on the next read (lazy expiry). `insert` is
/// the compare-and-swap primitive that breaks ties between concurrent
/// connects for the same explicit id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Get a record by id. Expired records read as `None`.
    async fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError>;

    /// Create a record. Fails with [`StoreError::Conflict`] if a live record
    /// already exists for the id.
    async fn insert(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Rewrite an existing record (or recreate it after expiry).
    async fn update(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Delete a record. Removing an absent record is a no-op.
    async fn remove(&self, id: SessionId) -> Result<(), StoreError>;

    /// All live records owned by an identity.
    async fn list_by_identity(&self, identity: &str) -> Result<Vec<SessionRecord>, StoreError>;
}
