//! Wire protocol: JSON-RPC 2.0 envelopes and MCP payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mcp_sessions_core::record::ToolDescriptor;

/// MCP protocol revision requested during initialize.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// JSON-RPC code for an unsupported method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JsonRpcRequest {
    #[must_use]
    pub const fn new(id: u64, method: &'static str, params: Value) -> Self {
        Self { jsonrpc: "2.0", id, method, params }
    }
}

/// Notification envelope (no id, no reply).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
}

impl JsonRpcNotification {
    #[must_use]
    pub const fn new(method: &'static str) -> Self {
        Self { jsonrpc: "2.0", method }
    }
}

/// Response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Client half of the initialize handshake.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: &'static str,
    pub capabilities: Value,
    pub client_info: Implementation,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            capabilities: serde_json::json!({}),
            client_info: Implementation {
                name: "mcp-sessions".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

/// Server half of the initialize handshake.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: Option<Implementation>,
    #[serde(default)]
    pub capabilities: Value,
}

/// `tools/list` page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<WireTool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Tool as advertised on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct WireTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
    #[serde(rename = "_meta", default)]
    pub meta: Option<Value>,
}

impl From<WireTool> for ToolDescriptor {
    fn from(tool: WireTool) -> Self {
        Self {
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
            meta: tool.meta,
        }
    }
}

/// `tools/call` arguments.
#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}
