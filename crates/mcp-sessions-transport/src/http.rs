//! Streamable HTTP channel.
//!
//! Every request is a POST carrying one JSON-RPC message. The server answers
//! either with a plain JSON body or by committing the response to an
//! event-stream body; both are accepted on every request, and the first
//! committed form is recorded as the negotiated transport kind.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use mcp_sessions_core::record::{ToolDescriptor, TransportKind};

use crate::channel::{ChannelFactory, ChannelInfo, ToolChannel, TransportError};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, METHOD_NOT_FOUND,
};
use crate::sse;

const CONNECT_TIMEOUT_SECONDS: u64 = 10;
const REQUEST_TIMEOUT_SECONDS: u64 = 60;
const POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Catalogs larger than this are truncated.
const MAX_TOOL_LIST: usize = 100;

const SESSION_ID_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";

fn build_http_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| TransportError::Connect(err.to_string()))
}

/// One streamable HTTP channel to a server endpoint.
pub struct StreamableHttpChannel {
    http: reqwest::Client,
    server_url: String,
    bearer_token: Option<String>,
    remote_session_id: Option<String>,
    negotiated_protocol_version: Option<String>,
    kind: Option<TransportKind>,
    next_request_id: u64,
}

impl StreamableHttpChannel {
    /// Create a channel over an existing pooled client.
    #[must_use]
    pub fn new(http: reqwest::Client, server_url: &str, bearer_token: Option<String>) -> Self {
        Self {
            http,
            server_url: server_url.to_string(),
            bearer_token,
            remote_session_id: None,
            negotiated_protocol_version: None,
            kind: None,
            next_request_id: 0,
        }
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, JSON_AND_SSE_ACCEPT);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(session_id) = &self.remote_session_id {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        if let Some(version) = &self.negotiated_protocol_version {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }
        request
    }

    async fn request(
        &mut self,
        method: &'static str,
        params: Value,
    ) -> Result<Value, TransportError> {
        self.next_request_id += 1;
        let envelope = JsonRpcRequest::new(self.next_request_id, method, params);
        let request = self.apply_headers(self.http.post(&self.server_url)).json(&envelope);
        let response = request.send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Unauthorized(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status: status.as_u16(), body });
        }

        if let Some(session_id) = header_str(&response, SESSION_ID_HEADER) {
            self.remote_session_id = Some(session_id);
        }

        let rpc = if header_str(&response, reqwest::header::CONTENT_TYPE.as_str())
            .as_deref()
            .is_some_and(sse::is_event_stream)
        {
            self.kind.get_or_insert(TransportKind::EventStream);
            first_response_from_stream(response).await?
        } else {
            self.kind.get_or_insert(TransportKind::StreamableHttp);
            response.json::<JsonRpcResponse>().await?
        };

        if let Some(error) = rpc.error {
            return Err(TransportError::Rpc { code: error.code, message: error.message });
        }
        rpc.result
            .ok_or_else(|| TransportError::Protocol("response carries no result".to_string()))
    }

    async fn notify(&mut self, method: &'static str) -> Result<(), TransportError> {
        let envelope = JsonRpcNotification::new(method);
        let response = self
            .apply_headers(self.http.post(&self.server_url))
            .json(&envelope)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl ToolChannel for StreamableHttpChannel {
    async fn initialize(&mut self) -> Result<ChannelInfo, TransportError> {
        let params = serde_json::to_value(InitializeParams::default())
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let result = self.request("initialize", params).await?;
        let initialize: InitializeResult = serde_json::from_value(result)
            .map_err(|err| TransportError::Protocol(format!("bad initialize result: {err}")))?;

        self.negotiated_protocol_version = Some(initialize.protocol_version.clone());
        self.notify("notifications/initialized").await?;

        let kind = self.kind.unwrap_or(TransportKind::StreamableHttp);
        debug!(url = %self.server_url, ?kind, version = %initialize.protocol_version, "channel initialized");
        Ok(ChannelInfo {
            kind,
            protocol_version: initialize.protocol_version,
            server_name: initialize.server_info.map(|info| info.name),
        })
    }

    async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let mut tools: Vec<ToolDescriptor> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .as_ref()
                .map_or_else(|| serde_json::json!({}), |c| serde_json::json!({ "cursor": c }));
            let result = self.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|err| TransportError::Protocol(format!("bad tool list: {err}")))?;

            tools.extend(page.tools.into_iter().map(Into::into));
            if tools.len() >= MAX_TOOL_LIST {
                tools.truncate(MAX_TOOL_LIST);
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(tools)
    }

    async fn call_tool(&mut self, name: &str, args: Value) -> Result<Value, TransportError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments: args,
        })
        .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.request("tools/call", params).await
    }

    async fn probe(&mut self) -> Result<(), TransportError> {
        match self.request("ping", Value::Null).await {
            Ok(_) => Ok(()),
            // A server without ping is still a live server.
            Err(TransportError::Rpc { code: METHOD_NOT_FOUND, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn kind(&self) -> Option<TransportKind> {
        self.kind
    }

    fn set_bearer_token(&mut self, token: Option<String>) {
        self.bearer_token = token;
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

/// Read an event-stream body until the server commits a JSON-RPC response.
///
/// Server-initiated requests and notifications on the same stream are
/// skipped; only a frame carrying `result` or `error` settles the call.
async fn first_response_from_stream(
    response: reqwest::Response,
) -> Result<JsonRpcResponse, TransportError> {
    let mut body = response.bytes_stream();
    let mut buffer = sse::LineBuffer::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(TransportError::from)?;
        for line in buffer.push(&chunk) {
            if let Some(rpc) = response_from_data_line(&line) {
                return Ok(rpc);
            }
        }
    }
    if let Some(line) = buffer.finish() {
        if let Some(rpc) = response_from_data_line(&line) {
            return Ok(rpc);
        }
    }

    Err(TransportError::Protocol("event stream ended without a response".to_string()))
}

fn response_from_data_line(line: &str) -> Option<JsonRpcResponse> {
    let payload = sse::data_payload(line)?;
    if payload.is_empty() {
        return None;
    }
    let rpc = serde_json::from_str::<JsonRpcResponse>(payload).ok()?;
    (rpc.result.is_some() || rpc.error.is_some()).then_some(rpc)
}

/// Factory dialing streamable HTTP channels over one shared pooled client.
pub struct HttpChannelFactory {
    http: reqwest::Client,
}

impl HttpChannelFactory {
    /// Create the factory and its pooled HTTP client.
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self { http: build_http_client()? })
    }
}

#[async_trait]
impl ChannelFactory for HttpChannelFactory {
    async fn dial(
        &self,
        server_url: &str,
        bearer_token: Option<&str>,
    ) -> Result<Box<dyn ToolChannel>, TransportError> {
        Ok(Box::new(StreamableHttpChannel::new(
            self.http.clone(),
            server_url,
            bearer_token.map(ToString::to_string),
        )))
    }
}
