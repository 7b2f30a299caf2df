//! File-system session storage: one JSON document per session.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use mcp_sessions_core::record::{SessionId, SessionRecord, now_epoch_s};
use mcp_sessions_core::store::{SessionStore, StoreError};

/// On-disk envelope: the record plus TTL bookkeeping.
#[derive(Serialize, Deserialize)]
struct Envelope {
    record: SessionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl Envelope {
    fn new(record: &SessionRecord, ttl: Option<Duration>) -> Self {
        Self {
            record: record.clone(),
            expires_at: ttl.map(|ttl| now_epoch_s().saturating_add(ttl.as_secs() as i64)),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| now_epoch_s() < at)
    }
}

/// File-backed storage: survives process restarts, no external service.
pub struct FileStore {
    dir: PathBuf,
    /// Serializes the existence check in `insert` against the write that
    /// follows it; the filesystem alone offers no compare-and-swap here.
    insert_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) the storage directory.
    ///
    /// `None` resolves to `mcp-sessions/sessions` under the platform data
    /// directory.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: Option<PathBuf>) -> Result<Self, StoreError> {
        let dir = match dir {
            Some(dir) => dir,
            None => dirs::data_dir()
                .ok_or_else(|| StoreError::Backend("no platform data directory".to_string()))?
                .join("mcp-sessions")
                .join("sessions"),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::Backend(format!("create {}: {err}", dir.display())))?;
        Ok(Self { dir, insert_lock: tokio::sync::Mutex::new(()) })
    }

    fn path_for(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read_envelope(&self, id: SessionId) -> Result<Option<Envelope>, StoreError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Backend(format!("read {}: {err}", path.display()))),
        };
        match serde_json::from_slice::<Envelope>(&bytes) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(err) => {
                // A torn or foreign file must not wedge the session id forever.
                warn!(path = %path.display(), %err, "discarding unreadable session file");
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    async fn write_envelope(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let path = self.path_for(envelope.record.session_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(envelope)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|err| StoreError::Backend(format!("write {}: {err}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|err| StoreError::Backend(format!("rename {}: {err}", path.display())))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn get(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        match self.read_envelope(id).await? {
            Some(envelope) if envelope.is_live() => Ok(Some(envelope.record)),
            Some(_) => {
                let _ = tokio::fs::remove_file(self.path_for(id)).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn insert(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let _guard = self.insert_lock.lock().await;
        if self.get(record.session_id).await?.is_some() {
            return Err(StoreError::Conflict(record.session_id));
        }
        self.write_envelope(&Envelope::new(record, ttl)).await
    }

    async fn update(
        &self,
        record: &SessionRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.write_envelope(&Envelope::new(record, ttl)).await
    }

    async fn remove(&self, id: SessionId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Backend(err.to_string())),
        }
    }

    async fn list_by_identity(&self, identity: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let mut result = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(envelope) = serde_json::from_slice::<Envelope>(&bytes) else {
                continue;
            };
            if envelope.is_live() && envelope.record.identity == identity {
                result.push(envelope.record);
            }
        }

        result.sort_by(|a, b| a.last_activity.cmp(&b.last_activity));
        Ok(result)
    }
}
