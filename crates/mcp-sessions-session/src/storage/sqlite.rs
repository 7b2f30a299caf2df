//! SQLite session storage over `sqlx`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use mcp_sessions_core::record::{SessionId, SessionRecord, now_epoch_s};
use mcp_sessions_core::store::{SessionStore, StoreError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    identity   TEXT NOT NULL,
    record     TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS sessions_identity ON sessions (identity);";

/// Embedded relational storage: survives restarts without an external service.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to (and create if needed) the database at `url`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sql_err)?
            .create_if_missing(true);
        // An in-memory database exists per connection; keep the pool at one
        // so every query sees the same data.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(sql_err)?;
        sqlx::query(SCHEMA).execute(&pool).await.map_err(sql_err)?;
        Ok(Self { pool })
    }

    async fn purge_if_expired(&self, id: SessionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ? AND expires_at IS NOT NULL AND expires_at <= ?")
            .bind(id.to_string())
            .bind(now_epoch_s())
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn expires_at(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_epoch_s().saturating_add(ttl.as_secs() as i64))
}

fn decode(json: &str) -> Result<SessionRecord, StoreError> {
    serde_json::from_str(json).map_err(|err| StoreError::Backend(format!("corrupt record: {err}")))
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.purge_if_expired(id).await?;
        let row = sqlx::query("SELECT record FROM sessions WHERE session_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;
        row.map(|row| decode(row.get::<&str, _>("record"))).transpose()
    }

    async fn insert(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.purge_if_expired(record.session_id).await?;
        let json = serde_json::to_string(record).map_err(|err| StoreError::Backend(err.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO sessions (session_id, identity, record, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(record.session_id.to_string())
        .bind(&record.identity)
        .bind(json)
        .bind(expires_at(ttl))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict(record.session_id))
            }
            Err(err) => Err(sql_err(err)),
        }
    }

    async fn update(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(record).map_err(|err| StoreError::Backend(err.to_string()))?;
        sqlx::query(
            "INSERT OR REPLACE INTO sessions (session_id, identity, record, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(record.session_id.to_string())
        .bind(&record.identity)
        .bind(json)
        .bind(expires_at(ttl))
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn remove(&self, id: SessionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn list_by_identity(&self, identity: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM sessions
             WHERE identity = ? AND (expires_at IS NULL OR expires_at > ?)
             ORDER BY rowid",
        )
        .bind(identity)
        .bind(now_epoch_s())
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.iter()
            .map(|row| decode(row.get::<&str, _>("record")))
            .collect()
    }
}
