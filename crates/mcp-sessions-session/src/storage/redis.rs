//! Redis session storage: the cross-process durable backend.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use mcp_sessions_core::record::{SessionId, SessionRecord};
use mcp_sessions_core::store::{SessionStore, StoreError};

const SESSION_KEY_PREFIX: &str = "mcp-sessions:session:";
const IDENTITY_KEY_PREFIX: &str = "mcp-sessions:identity:";

fn session_key(id: SessionId) -> String {
    format!("{SESSION_KEY_PREFIX}{id}")
}

fn identity_key(identity: &str) -> String {
    format!("{IDENTITY_KEY_PREFIX}{identity}")
}

fn redis_err(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// External network cache storage.
///
/// The only backend shared across processes: records expire natively via key
/// TTLs, and a per-identity index set is pruned lazily as dead ids are
/// observed.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to the Redis instance at `url`.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        let conn = ConnectionManager::new(client).await.map_err(redis_err)?;
        Ok(Self { conn })
    }

    async fn write(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
        create_only: bool,
    ) -> Result<bool, StoreError> {
        let json =
            serde_json::to_string(record).map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(session_key(record.session_id)).arg(json);
        if create_only {
            cmd.arg("NX");
        }
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        // SET NX answers nil when the key already holds a live record.
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(redis_err)?;
        if reply.is_none() {
            return Ok(false);
        }

        let _: () = conn
            .sadd(identity_key(&record.identity), record.session_id.to_string())
            .await
            .map_err(redis_err)?;
        Ok(true)
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(session_key(id)).await.map_err(redis_err)?;
        json.map(|json| {
            serde_json::from_str(&json)
                .map_err(|err| StoreError::Backend(format!("corrupt record: {err}")))
        })
        .transpose()
    }

    async fn insert(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if self.write(record, ttl, true).await? {
            Ok(())
        } else {
            Err(StoreError::Conflict(record.session_id))
        }
    }

    async fn update(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.write(record, ttl, false).await?;
        Ok(())
    }

    async fn remove(&self, id: SessionId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // Find the owning identity first so the index set stays tidy.
        if let Some(record) = self.get(id).await? {
            let _: () = conn
                .srem(identity_key(&record.identity), id.to_string())
                .await
                .map_err(redis_err)?;
        }
        let _: () = conn.del(session_key(id)).await.map_err(redis_err)?;
        Ok(())
    }

    async fn list_by_identity(&self, identity: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(identity_key(identity))
            .await
            .map_err(redis_err)?;

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(session_id) = id.parse::<SessionId>() else {
                continue;
            };
            match self.get(session_id).await? {
                Some(record) => result.push(record),
                None => {
                    // Key expired; drop the dangling index entry.
                    debug!(%session_id, "pruning expired session from identity index");
                    let _: () = conn
                        .srem(identity_key(identity), id)
                        .await
                        .map_err(redis_err)?;
                }
            }
        }

        result.sort_by(|a, b| a.last_activity.cmp(&b.last_activity));
        Ok(result)
    }
}
