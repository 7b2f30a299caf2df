//! The persisted session record and its constituent types.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Lifecycle state of a session.
///
/// Wire names are the exact strings exposed to callers. Only the registry
/// moves a session between states; every move follows a defined edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Initial state; never persisted.
    Disconnected,
    /// Transport dial in progress.
    Connecting,
    /// Authorization required; waiting on the redirect to come back.
    Authenticating,
    /// Tokens obtained, transport not yet usable.
    Authenticated,
    /// Fetching the remote tool catalog.
    Discovering,
    /// Usable. Tool calls are legal only here.
    Connected,
    /// Re-checking a restored session's liveness.
    Validating,
    /// Transient failure, retry scheduled.
    Reconnecting,
    /// Terminal failure; `error` holds the reason.
    Failed,
}

impl SessionState {
    /// Wire name of the state, e.g. `CONNECTED`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Authenticating => "AUTHENTICATING",
            Self::Authenticated => "AUTHENTICATED",
            Self::Discovering => "DISCOVERING",
            Self::Connected => "CONNECTED",
            Self::Validating => "VALIDATING",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
        }
    }
}

/// Negotiated transport channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Server commits responses to an event-stream body.
    EventStream,
    /// Server answers with plain JSON bodies over a bidirectional HTTP stream.
    StreamableHttp,
}

/// A tool advertised by the remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments, kept verbatim.
    pub input_schema: Value,
    /// Server-provided metadata, including any UI-resource linkage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// OAuth grant attached to a session once authorization succeeds.
///
/// Carries the token endpoint and client id alongside the tokens so a
/// restored session can refresh without re-running discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix epoch seconds after which the access token is invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl AuthTokens {
    /// Whether the access token is expired or inside the safety window.
    #[must_use]
    pub fn needs_refresh(&self, now_epoch_s: i64, safety_window_s: i64) -> bool {
        self.expires_at
            .is_some_and(|at| at <= now_epoch_s.saturating_add(safety_window_s))
    }
}

/// Classification of the fault recorded on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Network timeout or temporary transport failure; retried.
    Transient,
    /// Authorization failure; requires a new authorization round.
    Auth,
    /// Malformed server response or incompatible transport; fatal.
    Protocol,
    /// Duplicate explicit session id; state unaffected.
    Conflict,
}

/// Last fault observed on a session, cleared on successful transition.
///
/// The kind tag makes routing exact (e.g. "does this session need a fresh
/// authorization round?") without inspecting the message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFault {
    pub message: String,
    pub kind: FaultKind,
}

/// Persisted projection of a session.
///
/// Round-trips losslessly through every storage backend; backend-internal
/// TTL bookkeeping is not part of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session identifier, immutable after creation.
    pub session_id: SessionId,
    /// Owning principal; sessions are namespaced per identity.
    pub identity: String,
    pub server_id: String,
    pub server_name: String,
    pub server_url: String,
    pub state: SessionState,
    /// Set once transport negotiation commits to a channel kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    /// Present only once authorization has succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_tokens: Option<AuthTokens>,
    /// Redirect target of the original connect, kept so a later
    /// authorization round can be staged without a fresh connect call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Discovered tool catalog; empty until discovery completes.
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionFault>,
    /// Unix epoch seconds of the last successful operation.
    pub last_activity: i64,
    /// Bumped on disconnect; transitions referencing a stale generation are dropped.
    #[serde(default)]
    pub generation: u64,
}

impl SessionRecord {
    /// Create a fresh record in `CONNECTING`.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        identity: impl Into<String>,
        server_id: impl Into<String>,
        server_name: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            identity: identity.into(),
            server_id: server_id.into(),
            server_name: server_name.into(),
            server_url: server_url.into(),
            state: SessionState::Connecting,
            transport: None,
            auth_tokens: None,
            callback_url: None,
            tools: Vec::new(),
            error: None,
            last_activity: now_epoch_s(),
            generation: 0,
        }
    }

    /// Record a successful operation: clear the fault, bump activity.
    pub fn touch(&mut self) {
        self.error = None;
        self.last_activity = now_epoch_s();
    }
}

/// Current Unix epoch seconds.
#[must_use]
pub fn now_epoch_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
