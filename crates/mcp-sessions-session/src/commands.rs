//! Serializable command surface over the coordinator.
//!
//! Embedders that drive sessions over a wire (IPC, WebSocket, a job queue)
//! exchange these instead of calling the coordinator directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mcp_sessions_core::record::{FaultKind, SessionId, TransportKind};

use crate::coordinator::{ConnectRequest, SessionCoordinator};

/// Command addressed to the session layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionCommand {
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        server_id: String,
        server_name: String,
        server_url: String,
        callback_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport_type: Option<TransportKind>,
    },
    Disconnect {
        session_id: SessionId,
    },
    FinishAuth {
        session_id: SessionId,
        code: String,
    },
    CallTool {
        session_id: SessionId,
        tool_name: String,
        #[serde(default)]
        tool_args: Value,
    },
}

/// Immediate reply to a command. Lifecycle progress arrives separately as
/// events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandReply {
    Connected {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_url: Option<String>,
    },
    Ok,
    ToolResult {
        result: Value,
    },
    Error {
        message: String,
        kind: FaultKind,
    },
}

/// Run one command against the coordinator.
///
/// Failures come back as [`CommandReply::Error`] carrying the fault kind, so
/// wire consumers route on the tag rather than parsing message text.
pub async fn dispatch(coordinator: &SessionCoordinator, command: SessionCommand) -> CommandReply {
    let result = match command {
        SessionCommand::Connect {
            session_id,
            server_id,
            server_name,
            server_url,
            callback_url,
            transport_type,
        } => coordinator
            .connect(ConnectRequest {
                session_id,
                server_id,
                server_name,
                server_url,
                callback_url,
                preferred_transport: transport_type,
            })
            .await
            .map(|reply| CommandReply::Connected {
                session_id: reply.session_id,
                auth_url: reply.auth_url,
            }),
        SessionCommand::Disconnect { session_id } => coordinator
            .disconnect(session_id)
            .await
            .map(|()| CommandReply::Ok),
        SessionCommand::FinishAuth { session_id, code } => coordinator
            .finish_auth(session_id, &code)
            .await
            .map(|()| CommandReply::Ok),
        SessionCommand::CallTool { session_id, tool_name, tool_args } => coordinator
            .call_tool(session_id, &tool_name, tool_args)
            .await
            .map(|result| CommandReply::ToolResult { result }),
    };

    result.unwrap_or_else(|err| CommandReply::Error {
        message: err.to_string(),
        kind: err.kind(),
    })
}
