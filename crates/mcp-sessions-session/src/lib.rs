//! Session lifecycle orchestration and storage.
//!
//! Provides:
//! - `SessionRegistry` - Single authority over one session's state machine
//! - `SessionCoordinator` - Identity-scoped fan-out across sessions
//! - `SessionCommand` / `CommandReply` - RPC-style command surface
//! - Storage implementations (memory, file, SQLite, Redis)

pub mod commands;
pub mod coordinator;
pub mod registry;
pub mod storage;

pub use commands::{CommandReply, SessionCommand, dispatch};
pub use coordinator::{
    AggregatedTool, ConnectReply, ConnectRequest, SessionCoordinator, SessionFaultEntry,
    ToolAggregate,
};
pub use registry::{ConnectParams, SessionEnv, SessionRegistry};
