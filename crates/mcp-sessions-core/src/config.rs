//! Runtime configuration for the session layer.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// Process-local map; lost on restart.
    Memory,
    /// JSON files under a directory. `None` uses the platform data dir.
    File { dir: Option<std::path::PathBuf> },
    /// Embedded SQLite database, e.g. `sqlite://sessions.db`.
    Sqlite { url: String },
    /// External Redis cache, e.g. `redis://127.0.0.1/`.
    Redis { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl StoreConfig {
    /// Parse from `MCP_SESSIONS_STORE` (`memory` | `file` | `sqlite` |
    /// `redis`) plus `MCP_SESSIONS_STORE_URL` for the connection string.
    #[must_use]
    pub fn from_env() -> Self {
        let backend = std::env::var("MCP_SESSIONS_STORE").unwrap_or_default();
        let url = std::env::var("MCP_SESSIONS_STORE_URL").ok();
        match backend.as_str() {
            "file" => Self::File { dir: url.map(Into::into) },
            "sqlite" => Self::Sqlite {
                url: url.unwrap_or_else(|| "sqlite://mcp-sessions.db".to_string()),
            },
            "redis" => Self::Redis {
                url: url.unwrap_or_else(|| "redis://127.0.0.1/".to_string()),
            },
            _ => Self::Memory,
        }
    }
}

/// Tunables for the session registry and coordinator.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Storage backend for session records.
    pub store: StoreConfig,
    /// Timeout for transport dial and liveness probes.
    pub dial_timeout: Duration,
    /// Timeout for tool discovery.
    pub discovery_timeout: Duration,
    /// Timeout for OAuth token exchange.
    pub token_exchange_timeout: Duration,
    /// Backoff applied to transient failures and storage writes.
    pub retry: RetryPolicy,
    /// Interval between heartbeat events.
    pub heartbeat_interval: Duration,
    /// TTL applied to persisted records; `None` keeps them until disconnect.
    pub session_ttl: Option<Duration>,
    /// Restored tool catalogs older than this are re-fetched.
    pub tool_freshness: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            dial_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(30),
            token_exchange_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(15),
            session_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            tool_freshness: Duration::from_secs(5 * 60),
        }
    }
}

impl SessionConfig {
    /// Build from environment variables, falling back to defaults.
    ///
    /// Recognized: `MCP_SESSIONS_STORE`, `MCP_SESSIONS_STORE_URL`,
    /// `MCP_SESSIONS_HEARTBEAT_SECS`, `MCP_SESSIONS_MAX_ATTEMPTS`,
    /// `MCP_SESSIONS_BASE_DELAY_MS`, `MCP_SESSIONS_TTL_SECS`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self {
            store: StoreConfig::from_env(),
            ..Self::default()
        };
        if let Some(secs) = env_u64("MCP_SESSIONS_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_u64("MCP_SESSIONS_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts.min(u64::from(u32::MAX)) as u32;
        }
        if let Some(ms) = env_u64("MCP_SESSIONS_BASE_DELAY_MS") {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("MCP_SESSIONS_TTL_SECS") {
            config.session_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}
