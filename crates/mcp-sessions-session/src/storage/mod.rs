//! Storage implementations.

use std::sync::Arc;

use mcp_sessions_core::config::StoreConfig;
use mcp_sessions_core::store::{SessionStore, StoreError};

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

#[cfg(feature = "file")]
pub use file::FileStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "redis")]
pub use redis::RedisStore;

/// Build a storage backend from configuration.
///
/// # Errors
/// Returns an error if the selected backend is not compiled in or fails to
/// connect.
#[allow(unused_variables)]
pub async fn from_config(config: &StoreConfig) -> Result<Arc<dyn SessionStore>, StoreError> {
    match config {
        #[cfg(feature = "memory")]
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "file")]
        StoreConfig::File { dir } => Ok(Arc::new(FileStore::open(dir.clone()).await?)),
        #[cfg(feature = "sqlite")]
        StoreConfig::Sqlite { url } => Ok(Arc::new(SqliteStore::connect(url).await?)),
        #[cfg(feature = "redis")]
        StoreConfig::Redis { url } => Ok(Arc::new(RedisStore::connect(url).await?)),
        #[allow(unreachable_patterns)]
        other => Err(StoreError::Backend(format!(
            "storage backend {other:?} is not enabled in this build"
        ))),
    }
}
