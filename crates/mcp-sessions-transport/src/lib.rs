//! Client-side transport channel to remote MCP servers.
//!
//! Provides:
//! - Wire protocol (JSON-RPC 2.0 + the MCP methods the session layer needs)
//! - `ToolChannel` / `ChannelFactory` - Trait seams the registry dials through
//! - `StreamableHttpChannel` - HTTP channel accepting JSON or event-stream bodies

pub mod channel;
pub mod http;
pub mod protocol;
pub mod sse;

pub use channel::{ChannelFactory, ChannelInfo, ToolChannel, TransportError};
pub use http::{HttpChannelFactory, StreamableHttpChannel};
