//! Core abstractions for MCP session lifecycle management.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionRecord` / `SessionState` - The persisted session and its lifecycle states
//! - `SessionStore` - Pluggable storage backend trait
//! - `EventNotifier` / `SessionEvent` - Broadcast of typed lifecycle events
//! - `RetryPolicy` - Bounded exponential backoff with jitter
//! - `SessionConfig` - Timeouts, retry, heartbeat and backend selection

pub mod config;
pub mod error;
pub mod events;
pub mod record;
pub mod retry;
pub mod store;

pub use config::{SessionConfig, StoreConfig};
pub use error::SessionError;
pub use events::{EventNotifier, SessionEvent};
pub use record::{
    AuthTokens, FaultKind, SessionFault, SessionId, SessionRecord, SessionState, ToolDescriptor,
    TransportKind,
};
pub use retry::RetryPolicy;
pub use store::{SessionStore, StoreError};
