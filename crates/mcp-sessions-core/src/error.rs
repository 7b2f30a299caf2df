//! Session error taxonomy.

use thiserror::Error;

use crate::record::{FaultKind, SessionId, SessionState};
use crate::store::StoreError;

/// Error surfaced by session commands.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Network timeout or temporary transport failure. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Invalid or expired authorization. Never silently retried.
    #[error("authorization failed: {0}")]
    Auth(String),
    /// Malformed server response or incompatible transport. Fatal.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Duplicate explicit session id; the existing session must be reused.
    #[error("session already exists: {0}")]
    Conflict(SessionId),
    #[error("session not found: {0}")]
    NotFound(SessionId),
    /// Command is not legal in the session's current state.
    #[error("session not ready: state is {}", .0.as_str())]
    NotReady(SessionState),
    /// Storage backend failed after exhausting write retries.
    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl SessionError {
    /// Fault classification for the error, used when recording it on the
    /// session and when emitting it.
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::Transient(_) | Self::Storage(_) => FaultKind::Transient,
            Self::Auth(_) => FaultKind::Auth,
            Self::Protocol(_) | Self::NotFound(_) | Self::NotReady(_) => FaultKind::Protocol,
            Self::Conflict(_) => FaultKind::Conflict,
        }
    }

    /// Whether the registry should retry the operation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(id) => Self::Conflict(id),
            StoreError::Backend(msg) => Self::Storage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(SessionError::Transient("t".into()).kind(), FaultKind::Transient);
        assert_eq!(SessionError::Auth("a".into()).kind(), FaultKind::Auth);
        assert_eq!(SessionError::Protocol("p".into()).kind(), FaultKind::Protocol);
        assert_eq!(SessionError::Conflict(uuid::Uuid::nil()).kind(), FaultKind::Conflict);
        assert!(SessionError::Transient("t".into()).is_transient());
        assert!(!SessionError::Auth("a".into()).is_transient());
    }

    #[test]
    fn test_conflict_from_store() {
        let id = uuid::Uuid::new_v4();
        let err: SessionError = StoreError::Conflict(id).into();
        assert!(matches!(err, SessionError::Conflict(got) if got == id));
    }
}
