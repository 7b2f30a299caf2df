//! Typed lifecycle events and their broadcast fan-out.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::record::{FaultKind, SessionId, SessionState, ToolDescriptor, now_epoch_s};

/// Lifecycle event pushed to observers.
///
/// A closed sum type: each kind carries its own payload, so consumers never
/// shape-check a loose JSON blob. For a single session, events are delivered
/// in the order their causing transitions occurred.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session moved to a new state.
    StateChanged {
        session_id: SessionId,
        state: SessionState,
        timestamp: i64,
    },
    /// Tool discovery completed for a session.
    ToolsDiscovered {
        session_id: SessionId,
        tools: Vec<ToolDescriptor>,
        timestamp: i64,
    },
    /// A fault was recorded on a session.
    Error {
        session_id: SessionId,
        message: String,
        kind: FaultKind,
        timestamp: i64,
    },
    /// An established session lost its grant and a fresh authorization round
    /// was staged; callers surface the URL to the user.
    AuthorizationRequired {
        session_id: SessionId,
        auth_url: String,
        timestamp: i64,
    },
    /// Periodic keepalive; lets observers tell "server silent" from
    /// "connection dead".
    Heartbeat { timestamp: i64 },
}

impl SessionEvent {
    /// Session the event refers to, if any.
    #[must_use]
    pub const fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::StateChanged { session_id, .. }
            | Self::ToolsDiscovered { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::AuthorizationRequired { session_id, .. } => Some(*session_id),
            Self::Heartbeat { .. } => None,
        }
    }
}

/// Broadcast fan-out of session events for one identity.
///
/// Observers subscribe for live updates; slow observers that fall behind the
/// channel capacity miss events rather than blocking emitters.
pub struct EventNotifier {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNotifier {
    /// Create a new notifier.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    /// Emit a state change for a session.
    pub fn emit_state(&self, session_id: SessionId, state: SessionState) {
        self.emit(SessionEvent::StateChanged {
            session_id,
            state,
            timestamp: now_epoch_s(),
        });
    }

    /// Emit a discovered tool catalog.
    pub fn emit_tools(&self, session_id: SessionId, tools: Vec<ToolDescriptor>) {
        self.emit(SessionEvent::ToolsDiscovered {
            session_id,
            tools,
            timestamp: now_epoch_s(),
        });
    }

    /// Emit a fault.
    pub fn emit_error(&self, session_id: SessionId, message: impl Into<String>, kind: FaultKind) {
        self.emit(SessionEvent::Error {
            session_id,
            message: message.into(),
            kind,
            timestamp: now_epoch_s(),
        });
    }

    /// Emit a freshly staged authorization URL for an existing session.
    pub fn emit_auth_required(&self, session_id: SessionId, auth_url: impl Into<String>) {
        self.emit(SessionEvent::AuthorizationRequired {
            session_id,
            auth_url: auth_url.into(),
            timestamp: now_epoch_s(),
        });
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Live events as a stream, dropping lagged items.
    #[must_use]
    pub fn event_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Spawn a task that emits a heartbeat at the given interval.
    pub fn spawn_heartbeat(
        self: &std::sync::Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let notifier = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            // First beat lands one interval from now, not immediately:
            // subscribers expect silence until the session produces something.
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                notifier.emit(SessionEvent::Heartbeat {
                    timestamp: now_epoch_s(),
                });
            }
        })
    }
}
