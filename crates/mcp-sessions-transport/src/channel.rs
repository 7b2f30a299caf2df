//! Trait seams between the session registry and the transport.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use mcp_sessions_core::record::{ToolDescriptor, TransportKind};

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dial, request or read deadline elapsed. Transient.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// Connection could not be established or was dropped. Transient.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Non-success HTTP status outside the auth range.
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    /// 401/403: credentials missing, expired or rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Malformed frame, unexpected body shape or unsupported answer.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server answered with a JSON-RPC error.
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl TransportError {
    /// Whether a retry with backoff is worthwhile.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Unauthorized(_) | Self::Protocol(_) | Self::Rpc { .. } => false,
        }
    }

    /// Whether the failure calls for a fresh authorization round.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Connect(err.to_string())
        }
    }
}

/// Outcome of channel negotiation.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    /// Body form the server committed to.
    pub kind: TransportKind,
    pub protocol_version: String,
    pub server_name: Option<String>,
}

/// One live channel to a remote tool-providing server.
///
/// The registry owns exactly one channel per session and drives it from a
/// single task, hence `&mut self` throughout.
#[async_trait]
pub trait ToolChannel: Send {
    /// Run the initialize handshake and settle the channel kind.
    async fn initialize(&mut self) -> Result<ChannelInfo, TransportError>;

    /// Fetch the full tool catalog, following pagination.
    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError>;

    /// Invoke a remote tool.
    async fn call_tool(&mut self, name: &str, args: Value) -> Result<Value, TransportError>;

    /// Cheap liveness check for restored sessions.
    async fn probe(&mut self) -> Result<(), TransportError>;

    /// Negotiated kind, once `initialize` has settled it.
    fn kind(&self) -> Option<TransportKind>;

    /// Replace the bearer token used on subsequent requests.
    fn set_bearer_token(&mut self, token: Option<String>);
}

/// Dials channels to server endpoints.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Open (but do not initialize) a channel to `server_url`.
    async fn dial(
        &self,
        server_url: &str,
        bearer_token: Option<&str>,
    ) -> Result<Box<dyn ToolChannel>, TransportError>;
}
