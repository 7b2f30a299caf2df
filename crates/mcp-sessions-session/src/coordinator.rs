//! Multi-session coordination for one identity.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mcp_sessions_core::error::SessionError;
use mcp_sessions_core::events::EventNotifier;
use mcp_sessions_core::record::{
    SessionFault, SessionId, SessionRecord, SessionState, ToolDescriptor, TransportKind,
};

use crate::registry::{ConnectParams, SessionEnv, SessionRegistry};

/// What a caller provides to open a session.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub session_id: Option<SessionId>,
    pub server_id: String,
    pub server_name: String,
    pub server_url: String,
    pub callback_url: String,
    pub preferred_transport: Option<TransportKind>,
}

/// Immediate answer to a connect: the id, plus the authorization URL when the
/// server demands a round before dialing. The rest of the lifecycle arrives
/// as events.
#[derive(Debug, Clone)]
pub struct ConnectReply {
    pub session_id: SessionId,
    pub auth_url: Option<String>,
}

/// One tool in the identity-wide aggregate view.
#[derive(Debug, Clone)]
pub struct AggregatedTool {
    pub session_id: SessionId,
    pub server_id: String,
    pub tool: ToolDescriptor,
}

/// Fault of a session that contributed nothing to the aggregate.
#[derive(Debug, Clone)]
pub struct SessionFaultEntry {
    pub session_id: SessionId,
    pub server_id: String,
    pub fault: SessionFault,
}

/// Identity-wide tool view. Building it never fails as a whole: sessions
/// outside `CONNECTED` contribute an empty tool set, and their recorded
/// faults ride along so callers can tell a quiet server from a broken one.
#[derive(Debug, Clone, Default)]
pub struct ToolAggregate {
    pub tools: Vec<AggregatedTool>,
    pub faults: Vec<SessionFaultEntry>,
}

/// Owns every session registry for one identity and fans commands out to
/// them. Operations on different sessions run concurrently; the coordinator
/// itself never serializes them.
pub struct SessionCoordinator {
    identity: String,
    env: Arc<SessionEnv>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionRegistry>>>,
    heartbeat: JoinHandle<()>,
}

impl SessionCoordinator {
    /// Create a coordinator and start its heartbeat.
    #[must_use]
    pub fn new(identity: impl Into<String>, env: Arc<SessionEnv>) -> Self {
        let heartbeat = env.notifier.spawn_heartbeat(env.config.heartbeat_interval);
        Self {
            identity: identity.into(),
            env,
            sessions: RwLock::new(HashMap::new()),
            heartbeat,
        }
    }

    /// Identity this coordinator serves.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Event notifier shared by every session under this coordinator.
    #[must_use]
    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.env.notifier
    }

    /// Open a session against a server.
    ///
    /// Returns as soon as the session exists; dialing and discovery continue
    /// in the background and surface as events.
    ///
    /// # Errors
    /// Fails with [`SessionError::Conflict`] when an explicit id is already
    /// in use, or with the classified failure of the authorization probe.
    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectReply, SessionError> {
        if let Some(id) = request.session_id {
            if self.sessions.read().await.contains_key(&id) {
                return Err(SessionError::Conflict(id));
            }
        }

        let (registry, auth_url) = SessionRegistry::open(
            Arc::clone(&self.env),
            ConnectParams {
                session_id: request.session_id,
                identity: self.identity.clone(),
                server_id: request.server_id,
                server_name: request.server_name,
                server_url: request.server_url,
                callback_url: request.callback_url,
                preferred_transport: request.preferred_transport,
            },
        )
        .await?;

        let session_id = registry.id();
        self.sessions.write().await.insert(session_id, registry);
        Ok(ConnectReply { session_id, auth_url })
    }

    /// Complete a pending authorization round with the redirected code.
    ///
    /// # Errors
    /// Fails when the session is unknown, is not awaiting authorization, or
    /// the authorization server rejects the code.
    pub async fn finish_auth(&self, session_id: SessionId, code: &str) -> Result<(), SessionError> {
        self.registry(session_id).await?.finish_auth(code).await
    }

    /// Invoke a tool on a connected session.
    ///
    /// # Errors
    /// Fails when the session is unknown, not `CONNECTED`, or the call
    /// itself fails.
    pub async fn call_tool(
        &self,
        session_id: SessionId,
        name: &str,
        args: Value,
    ) -> Result<Value, SessionError> {
        self.registry(session_id).await?.call_tool(name, args).await
    }

    /// Tear a session down. Unknown ids are a no-op, so retried disconnects
    /// and races with expiry stay silent.
    ///
    /// # Errors
    /// Only a storage outage that survives the retry budget is escalated.
    pub async fn disconnect(&self, session_id: SessionId) -> Result<(), SessionError> {
        let registry = self.sessions.write().await.remove(&session_id);
        match registry {
            Some(registry) => registry.disconnect().await,
            None => Ok(()),
        }
    }

    /// Tear down every session, best effort. Failures are logged and do not
    /// stop the sweep.
    pub async fn disconnect_all(&self) {
        let registries: Vec<_> = self.sessions.write().await.drain().collect();
        for (session_id, registry) in registries {
            if let Err(err) = registry.disconnect().await {
                warn!(%session_id, %err, "disconnect failed during sweep");
            }
        }
    }

    /// Load persisted sessions for this identity and start validating them
    /// in the background. Returns how many were picked up.
    ///
    /// # Errors
    /// Fails only when the storage backend cannot be listed.
    pub async fn restore_sessions(&self) -> Result<usize, SessionError> {
        let records = self.env.store.list_by_identity(&self.identity).await?;
        let mut sessions = self.sessions.write().await;
        let mut restored = 0;
        for record in records {
            if sessions.contains_key(&record.session_id) {
                continue;
            }
            let session_id = record.session_id;
            let registry = SessionRegistry::restore(Arc::clone(&self.env), record);
            registry.spawn_validate();
            sessions.insert(session_id, registry);
            restored += 1;
        }
        if restored > 0 {
            info!(identity = %self.identity, restored, "restoring persisted sessions");
        }
        Ok(restored)
    }

    /// Current record of one session.
    ///
    /// # Errors
    /// Fails when the session is unknown.
    pub async fn snapshot(&self, session_id: SessionId) -> Result<SessionRecord, SessionError> {
        Ok(self.registry(session_id).await?.snapshot().await)
    }

    /// Current records of every tracked session.
    pub async fn snapshots(&self) -> Vec<SessionRecord> {
        let registries: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(registries.len());
        for registry in registries {
            records.push(registry.snapshot().await);
        }
        records
    }

    /// Aggregate tool view across every `CONNECTED` session.
    ///
    /// A partially failed fleet still yields the tools of its healthy
    /// members. The tool order is deterministic: by server id, then tool
    /// name, then session id.
    pub async fn list_tools(&self) -> ToolAggregate {
        let mut aggregate = ToolAggregate::default();
        for record in self.snapshots().await {
            if record.state == SessionState::Connected {
                for tool in record.tools {
                    aggregate.tools.push(AggregatedTool {
                        session_id: record.session_id,
                        server_id: record.server_id.clone(),
                        tool,
                    });
                }
            } else if let Some(fault) = record.error {
                aggregate.faults.push(SessionFaultEntry {
                    session_id: record.session_id,
                    server_id: record.server_id,
                    fault,
                });
            }
        }
        aggregate.tools.sort_by(|a, b| {
            (&a.server_id, &a.tool.name, a.session_id)
                .cmp(&(&b.server_id, &b.tool.name, b.session_id))
        });
        aggregate.faults.sort_by_key(|entry| entry.session_id);
        aggregate
    }

    async fn registry(&self, session_id: SessionId) -> Result<Arc<SessionRegistry>, SessionError> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::NotFound(session_id))
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use mcp_sessions_core::config::SessionConfig;
    use mcp_sessions_core::events::SessionEvent;
    use mcp_sessions_core::record::{AuthTokens, FaultKind, now_epoch_s};
    use mcp_sessions_core::retry::RetryPolicy;
    use mcp_sessions_oauth::negotiator::{AuthChallenge, Authorizer, OAuthError};
    use mcp_sessions_transport::channel::{
        ChannelFactory, ChannelInfo, ToolChannel, TransportError,
    };

    use crate::storage::MemoryStore;

    use super::*;

    struct ScriptedChannel {
        tools: Vec<ToolDescriptor>,
        kind: TransportKind,
        bearer_token: Option<String>,
    }

    #[async_trait]
    impl ToolChannel for ScriptedChannel {
        async fn initialize(&mut self) -> Result<ChannelInfo, TransportError> {
            Ok(ChannelInfo {
                kind: self.kind,
                protocol_version: "2025-03-26".to_string(),
                server_name: Some("Example".to_string()),
            })
        }

        async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, TransportError> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&mut self, name: &str, args: Value) -> Result<Value, TransportError> {
            Ok(json!({ "tool": name, "args": args, "token": self.bearer_token }))
        }

        async fn probe(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn kind(&self) -> Option<TransportKind> {
            Some(self.kind)
        }

        fn set_bearer_token(&mut self, token: Option<String>) {
            self.bearer_token = token;
        }
    }

    struct ScriptedFactory {
        tools: Vec<ToolDescriptor>,
        /// This many dials time out before one succeeds.
        fail_dials: AtomicUsize,
        /// Delay applied to every dial, for racing disconnects against it.
        dial_delay: Duration,
        dials: AtomicUsize,
    }

    impl ScriptedFactory {
        fn new(tools: Vec<ToolDescriptor>) -> Self {
            Self {
                tools,
                fail_dials: AtomicUsize::new(0),
                dial_delay: Duration::ZERO,
                dials: AtomicUsize::new(0),
            }
        }

        fn failing_first(tools: Vec<ToolDescriptor>, failures: usize) -> Self {
            Self {
                fail_dials: AtomicUsize::new(failures),
                ..Self::new(tools)
            }
        }
    }

    #[async_trait]
    impl ChannelFactory for ScriptedFactory {
        async fn dial(
            &self,
            _server_url: &str,
            bearer_token: Option<&str>,
        ) -> Result<Box<dyn ToolChannel>, TransportError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if !self.dial_delay.is_zero() {
                tokio::time::sleep(self.dial_delay).await;
            }
            if self
                .fail_dials
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Timeout("dial".to_string()));
            }
            Ok(Box::new(ScriptedChannel {
                tools: self.tools.clone(),
                kind: TransportKind::StreamableHttp,
                bearer_token: bearer_token.map(str::to_string),
            }))
        }
    }

    /// Server with no authorization requirement.
    struct OpenServer;

    #[async_trait]
    impl Authorizer for OpenServer {
        async fn probe(&self, _server_url: &str) -> Result<Option<AuthChallenge>, OAuthError> {
            Ok(None)
        }

        async fn begin(
            &self,
            _session_id: SessionId,
            _challenge: &AuthChallenge,
            _callback_url: &str,
        ) -> Result<String, OAuthError> {
            unreachable!("open server never begins authorization")
        }

        async fn finish(
            &self,
            session_id: SessionId,
            _code: &str,
        ) -> Result<AuthTokens, OAuthError> {
            Err(OAuthError::NoPendingAuthorization(session_id))
        }

        async fn refresh(&self, _tokens: &AuthTokens) -> Result<AuthTokens, OAuthError> {
            Err(OAuthError::MissingTokenEndpoint)
        }

        async fn cancel(&self, _session_id: SessionId) {}
    }

    /// How a [`GatedServer`] answers refresh requests.
    enum RefreshOutcome {
        Fresh,
        /// The grant was revoked server-side.
        Rejected,
        /// The token endpoint could not be reached at all.
        Unreachable,
    }

    /// Server that accepts exactly one code and refreshes on demand.
    struct GatedServer {
        /// Seconds until the exchanged access token expires.
        expires_in: i64,
        refresh: RefreshOutcome,
    }

    impl GatedServer {
        const fn new() -> Self {
            Self { expires_in: 3_600, refresh: RefreshOutcome::Fresh }
        }
    }

    #[async_trait]
    impl Authorizer for GatedServer {
        async fn probe(&self, _server_url: &str) -> Result<Option<AuthChallenge>, OAuthError> {
            Ok(Some(AuthChallenge {
                authorization_endpoint: "https://auth.example.com/authorize".to_string(),
                token_endpoint: "https://auth.example.com/token".to_string(),
                registration_endpoint: None,
                issuer: None,
                scope: None,
            }))
        }

        async fn begin(
            &self,
            session_id: SessionId,
            challenge: &AuthChallenge,
            _callback_url: &str,
        ) -> Result<String, OAuthError> {
            Ok(format!(
                "{}?session={session_id}",
                challenge.authorization_endpoint
            ))
        }

        async fn finish(&self, _session_id: SessionId, code: &str) -> Result<AuthTokens, OAuthError> {
            if code != "good-code" {
                return Err(OAuthError::CodeRejected {
                    status: 400,
                    body: "invalid_grant".to_string(),
                });
            }
            Ok(AuthTokens {
                access_token: "access-1".to_string(),
                refresh_token: Some("refresh-1".to_string()),
                expires_at: Some(now_epoch_s() + self.expires_in),
                token_endpoint: Some("https://auth.example.com/token".to_string()),
                client_id: Some("client-1".to_string()),
            })
        }

        async fn refresh(&self, tokens: &AuthTokens) -> Result<AuthTokens, OAuthError> {
            match self.refresh {
                RefreshOutcome::Fresh => Ok(AuthTokens {
                    access_token: "access-2".to_string(),
                    expires_at: Some(now_epoch_s() + 3_600),
                    ..tokens.clone()
                }),
                RefreshOutcome::Rejected => {
                    Err(OAuthError::RefreshFailed("revoked".to_string()))
                }
                RefreshOutcome::Unreachable => {
                    Err(OAuthError::Http("connect timeout".to_string()))
                }
            }
        }

        async fn cancel(&self, _session_id: SessionId) {}
    }

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            meta: None,
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            retry: RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            heartbeat_interval: Duration::from_secs(60),
            session_ttl: None,
            ..SessionConfig::default()
        }
    }

    /// Honors `RUST_LOG` when a test run needs lifecycle traces.
    fn init_tracing() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    fn env_with(
        factory: ScriptedFactory,
        authorizer: Arc<dyn Authorizer>,
        config: SessionConfig,
    ) -> Arc<SessionEnv> {
        init_tracing();
        Arc::new(SessionEnv {
            store: Arc::new(MemoryStore::new()),
            channels: Arc::new(factory),
            authorizer,
            notifier: Arc::new(EventNotifier::new()),
            config,
        })
    }

    fn request() -> ConnectRequest {
        ConnectRequest {
            session_id: None,
            server_id: "srv-1".to_string(),
            server_name: "Example".to_string(),
            server_url: "https://mcp.example.com".to_string(),
            callback_url: "http://localhost:8123/callback".to_string(),
            preferred_transport: None,
        }
    }

    /// Next non-heartbeat event, bounded by a deadline.
    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event within deadline")
                .expect("event channel open");
            if !matches!(event, SessionEvent::Heartbeat { .. }) {
                return event;
            }
        }
    }

    async fn expect_state(rx: &mut broadcast::Receiver<SessionEvent>, expected: SessionState) {
        let event = next_event(rx).await;
        match event {
            SessionEvent::StateChanged { state, .. } if state == expected => {}
            other => panic!("expected {expected:?} state change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_reaches_connected_in_order() {
        let env = env_with(
            ScriptedFactory::new(vec![tool("search")]),
            Arc::new(OpenServer),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", Arc::clone(&env));
        let mut rx = coordinator.notifier().subscribe();

        let reply = coordinator.connect(request()).await.unwrap();
        assert!(reply.auth_url.is_none());

        expect_state(&mut rx, SessionState::Connecting).await;
        expect_state(&mut rx, SessionState::Discovering).await;
        match next_event(&mut rx).await {
            SessionEvent::ToolsDiscovered { session_id, tools, .. } => {
                assert_eq!(session_id, reply.session_id);
                assert_eq!(tools.len(), 1);
            }
            other => panic!("expected tool discovery, got {other:?}"),
        }
        expect_state(&mut rx, SessionState::Connected).await;

        let record = coordinator.snapshot(reply.session_id).await.unwrap();
        assert_eq!(record.state, SessionState::Connected);
        assert_eq!(record.transport, Some(TransportKind::StreamableHttp));
        assert!(env.store.get(reply.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_authorization_round_trip() {
        let env = env_with(
            ScriptedFactory::new(vec![tool("search")]),
            Arc::new(GatedServer::new()),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", env);
        let mut rx = coordinator.notifier().subscribe();

        let reply = coordinator.connect(request()).await.unwrap();
        assert!(reply.auth_url.as_deref().is_some_and(|url| url.starts_with("https://auth.example.com/authorize")));
        expect_state(&mut rx, SessionState::Connecting).await;
        expect_state(&mut rx, SessionState::Authenticating).await;

        coordinator.finish_auth(reply.session_id, "good-code").await.unwrap();
        expect_state(&mut rx, SessionState::Authenticated).await;
        expect_state(&mut rx, SessionState::Discovering).await;
        assert!(matches!(next_event(&mut rx).await, SessionEvent::ToolsDiscovered { .. }));
        expect_state(&mut rx, SessionState::Connected).await;

        let record = coordinator.snapshot(reply.session_id).await.unwrap();
        let tokens = record.auth_tokens.expect("tokens persisted");
        assert_eq!(tokens.access_token, "access-1");

        // The channel was dialed with the fresh token.
        let result = coordinator
            .call_tool(reply.session_id, "search", json!({"q": "x"}))
            .await
            .unwrap();
        assert_eq!(result["token"], json!("access-1"));
    }

    #[tokio::test]
    async fn test_rejected_code_fails_with_auth_kind() {
        let env = env_with(
            ScriptedFactory::new(vec![]),
            Arc::new(GatedServer::new()),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", env);
        let mut rx = coordinator.notifier().subscribe();

        let reply = coordinator.connect(request()).await.unwrap();
        expect_state(&mut rx, SessionState::Connecting).await;
        expect_state(&mut rx, SessionState::Authenticating).await;

        let err = coordinator
            .finish_auth(reply.session_id, "wrong-code")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::Auth);

        expect_state(&mut rx, SessionState::Failed).await;
        match next_event(&mut rx).await {
            SessionEvent::Error { kind, message, .. } => {
                assert_eq!(kind, FaultKind::Auth);
                assert!(message.contains("invalid_grant"));
            }
            other => panic!("expected error event, got {other:?}"),
        }

        let record = coordinator.snapshot(reply.session_id).await.unwrap();
        assert_eq!(record.state, SessionState::Failed);
        assert_eq!(record.error.unwrap().kind, FaultKind::Auth);
    }

    #[tokio::test]
    async fn test_transient_dial_failures_retry_then_connect() {
        let env = env_with(
            ScriptedFactory::failing_first(vec![tool("search")], 3),
            Arc::new(OpenServer),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", env);
        let mut rx = coordinator.notifier().subscribe();

        coordinator.connect(request()).await.unwrap();
        expect_state(&mut rx, SessionState::Connecting).await;
        expect_state(&mut rx, SessionState::Reconnecting).await;
        expect_state(&mut rx, SessionState::Reconnecting).await;
        expect_state(&mut rx, SessionState::Reconnecting).await;
        expect_state(&mut rx, SessionState::Discovering).await;
        assert!(matches!(next_event(&mut rx).await, SessionEvent::ToolsDiscovered { .. }));
        expect_state(&mut rx, SessionState::Connected).await;
    }

    #[tokio::test]
    async fn test_exhausted_retry_budget_fails_transient() {
        let mut config = test_config();
        config.retry.max_attempts = 2;
        let env = env_with(
            ScriptedFactory::failing_first(vec![], 10),
            Arc::new(OpenServer),
            config,
        );
        let coordinator = SessionCoordinator::new("user-1", env);
        let mut rx = coordinator.notifier().subscribe();

        let reply = coordinator.connect(request()).await.unwrap();
        expect_state(&mut rx, SessionState::Connecting).await;
        expect_state(&mut rx, SessionState::Reconnecting).await;
        expect_state(&mut rx, SessionState::Failed).await;
        match next_event(&mut rx).await {
            SessionEvent::Error { kind, .. } => assert_eq!(kind, FaultKind::Transient),
            other => panic!("expected error event, got {other:?}"),
        }

        let record = coordinator.snapshot(reply.session_id).await.unwrap();
        assert_eq!(record.error.unwrap().kind, FaultKind::Transient);
    }

    #[tokio::test]
    async fn test_duplicate_explicit_id_conflicts() {
        let env = env_with(
            ScriptedFactory::new(vec![]),
            Arc::new(OpenServer),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", env);

        let id = Uuid::new_v4();
        let mut first = request();
        first.session_id = Some(id);
        coordinator.connect(first.clone()).await.unwrap();

        let err = coordinator.connect(first).await.unwrap_err();
        assert!(matches!(err, SessionError::Conflict(got) if got == id));
        // The existing session is untouched.
        assert!(coordinator.snapshot(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let env = env_with(
            ScriptedFactory::new(vec![tool("search")]),
            Arc::new(OpenServer),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", Arc::clone(&env));
        let mut rx = coordinator.notifier().subscribe();

        let reply = coordinator.connect(request()).await.unwrap();
        loop {
            if let SessionEvent::StateChanged { state: SessionState::Connected, .. } =
                next_event(&mut rx).await
            {
                break;
            }
        }

        coordinator.disconnect(reply.session_id).await.unwrap();
        expect_state(&mut rx, SessionState::Disconnected).await;
        assert!(env.store.get(reply.session_id).await.unwrap().is_none());

        // Second disconnect: no error, no second event.
        coordinator.disconnect(reply.session_id).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_disconnect_supersedes_inflight_connect() {
        let mut factory = ScriptedFactory::new(vec![tool("search")]);
        factory.dial_delay = Duration::from_millis(100);
        let env = env_with(factory, Arc::new(OpenServer), test_config());
        let coordinator = SessionCoordinator::new("user-1", Arc::clone(&env));
        let mut rx = coordinator.notifier().subscribe();

        let reply = coordinator.connect(request()).await.unwrap();
        expect_state(&mut rx, SessionState::Connecting).await;

        // Disconnect while the dial is still sleeping.
        coordinator.disconnect(reply.session_id).await.unwrap();
        expect_state(&mut rx, SessionState::Disconnected).await;

        // The dial completes later but its transition is stale and dropped.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err(),
            "superseded connect must not emit"
        );
        assert!(env.store.get(reply.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_reuses_fresh_tool_catalog() {
        let env = env_with(
            ScriptedFactory::new(vec![tool("stale-replacement")]),
            Arc::new(OpenServer),
            test_config(),
        );
        let mut record = SessionRecord::new(
            Uuid::new_v4(),
            "user-1",
            "srv-1",
            "Example",
            "https://mcp.example.com",
        );
        record.state = SessionState::Connected;
        record.tools = vec![tool("cached-search")];
        record.auth_tokens = Some(AuthTokens {
            access_token: "access-restored".to_string(),
            refresh_token: None,
            expires_at: Some(now_epoch_s() + 3_600),
            token_endpoint: None,
            client_id: None,
        });
        env.store.insert(&record, None).await.unwrap();

        let coordinator = SessionCoordinator::new("user-1", Arc::clone(&env));
        let mut rx = coordinator.notifier().subscribe();
        assert_eq!(coordinator.restore_sessions().await.unwrap(), 1);

        expect_state(&mut rx, SessionState::Validating).await;
        expect_state(&mut rx, SessionState::Connected).await;

        // Catalog was fresh, so it was kept rather than re-fetched.
        let restored = coordinator.snapshot(record.session_id).await.unwrap();
        assert_eq!(restored.tools[0].name, "cached-search");

        // The persisted tokens were reused; no new authorization round ran.
        let result = coordinator
            .call_tool(record.session_id, "cached-search", json!({}))
            .await
            .unwrap();
        assert_eq!(result["token"], json!("access-restored"));
    }

    #[tokio::test]
    async fn test_restore_refetches_stale_catalog() {
        let env = env_with(
            ScriptedFactory::new(vec![tool("fresh-search")]),
            Arc::new(OpenServer),
            test_config(),
        );
        let mut record = SessionRecord::new(
            Uuid::new_v4(),
            "user-1",
            "srv-1",
            "Example",
            "https://mcp.example.com",
        );
        record.state = SessionState::Connected;
        record.tools = vec![tool("cached-search")];
        record.last_activity = now_epoch_s() - 3_600;
        env.store.insert(&record, None).await.unwrap();

        let coordinator = SessionCoordinator::new("user-1", Arc::clone(&env));
        let mut rx = coordinator.notifier().subscribe();
        coordinator.restore_sessions().await.unwrap();

        expect_state(&mut rx, SessionState::Validating).await;
        assert!(matches!(next_event(&mut rx).await, SessionEvent::ToolsDiscovered { .. }));
        expect_state(&mut rx, SessionState::Connected).await;

        let restored = coordinator.snapshot(record.session_id).await.unwrap();
        assert_eq!(restored.tools[0].name, "fresh-search");
    }

    #[tokio::test]
    async fn test_list_tools_tolerates_failed_siblings() {
        let env = env_with(
            ScriptedFactory::new(vec![tool("beta"), tool("alpha")]),
            Arc::new(GatedServer::new()),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", env);
        let mut rx = coordinator.notifier().subscribe();

        // One session driven into FAILED by a rejected code.
        let failed = coordinator.connect(request()).await.unwrap();
        let _ = coordinator.finish_auth(failed.session_id, "wrong-code").await;

        // One session fully connected.
        let mut second = request();
        second.server_id = "srv-2".to_string();
        let connected = coordinator.connect(second).await.unwrap();
        coordinator
            .finish_auth(connected.session_id, "good-code")
            .await
            .unwrap();
        loop {
            if let SessionEvent::StateChanged { session_id, state: SessionState::Connected, .. } =
                next_event(&mut rx).await
            {
                if session_id == connected.session_id {
                    break;
                }
            }
        }

        let aggregate = coordinator.list_tools().await;
        assert_eq!(aggregate.tools.len(), 2);
        assert!(aggregate.tools.iter().all(|t| t.session_id == connected.session_id));
        assert_eq!(aggregate.tools[0].tool.name, "alpha");
        assert_eq!(aggregate.tools[1].tool.name, "beta");
        assert_eq!(aggregate.tools[0].server_id, "srv-2");

        // The broken sibling shows up with its fault, not as a hard failure.
        assert_eq!(aggregate.faults.len(), 1);
        assert_eq!(aggregate.faults[0].session_id, failed.session_id);
        assert_eq!(aggregate.faults[0].fault.kind, FaultKind::Auth);
    }

    #[tokio::test]
    async fn test_call_tool_rejected_outside_connected() {
        let env = env_with(
            ScriptedFactory::new(vec![]),
            Arc::new(GatedServer::new()),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", env);

        let reply = coordinator.connect(request()).await.unwrap();
        let err = coordinator
            .call_tool(reply.session_id, "search", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotReady(SessionState::Authenticating)));

        let unknown = coordinator
            .call_tool(Uuid::new_v4(), "search", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(unknown, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_expiring_token_refreshed_before_call() {
        let env = env_with(
            ScriptedFactory::new(vec![tool("search")]),
            // Expires inside the refresh safety window.
            Arc::new(GatedServer { expires_in: 30, refresh: RefreshOutcome::Fresh }),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", env);
        let mut rx = coordinator.notifier().subscribe();

        let reply = coordinator.connect(request()).await.unwrap();
        coordinator.finish_auth(reply.session_id, "good-code").await.unwrap();
        loop {
            if let SessionEvent::StateChanged { state: SessionState::Connected, .. } =
                next_event(&mut rx).await
            {
                break;
            }
        }

        coordinator
            .call_tool(reply.session_id, "search", json!({}))
            .await
            .unwrap();
        let record = coordinator.snapshot(reply.session_id).await.unwrap();
        assert_eq!(record.auth_tokens.unwrap().access_token, "access-2");
    }

    #[tokio::test]
    async fn test_unreachable_token_endpoint_keeps_grant() {
        let env = env_with(
            ScriptedFactory::new(vec![tool("search")]),
            Arc::new(GatedServer { expires_in: 30, refresh: RefreshOutcome::Unreachable }),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", env);
        let mut rx = coordinator.notifier().subscribe();

        let reply = coordinator.connect(request()).await.unwrap();
        coordinator.finish_auth(reply.session_id, "good-code").await.unwrap();
        loop {
            if let SessionEvent::StateChanged { state: SessionState::Connected, .. } =
                next_event(&mut rx).await
            {
                break;
            }
        }

        // The token endpoint being down is a network problem, not a bad
        // grant: the caller may retry and the session stays usable.
        let err = coordinator
            .call_tool(reply.session_id, "search", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::Transient);

        let record = coordinator.snapshot(reply.session_id).await.unwrap();
        assert_eq!(record.state, SessionState::Connected);
        assert_eq!(
            record.auth_tokens.expect("grant retained").access_token,
            "access-1"
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_demands_new_authorization() {
        let env = env_with(
            ScriptedFactory::new(vec![tool("search")]),
            Arc::new(GatedServer { expires_in: 30, refresh: RefreshOutcome::Rejected }),
            test_config(),
        );
        let coordinator = SessionCoordinator::new("user-1", env);
        let mut rx = coordinator.notifier().subscribe();

        let reply = coordinator.connect(request()).await.unwrap();
        coordinator.finish_auth(reply.session_id, "good-code").await.unwrap();
        loop {
            if let SessionEvent::StateChanged { state: SessionState::Connected, .. } =
                next_event(&mut rx).await
            {
                break;
            }
        }

        let err = coordinator
            .call_tool(reply.session_id, "search", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::Auth);

        let record = coordinator.snapshot(reply.session_id).await.unwrap();
        assert_eq!(record.state, SessionState::Authenticating);
        assert!(record.auth_tokens.is_none(), "dead grant must be dropped");

        // A fresh round was staged and its URL surfaced, so the session is
        // actionable rather than stuck.
        expect_state(&mut rx, SessionState::Authenticating).await;
        match next_event(&mut rx).await {
            SessionEvent::Error { kind, .. } => assert_eq!(kind, FaultKind::Auth),
            other => panic!("expected error event, got {other:?}"),
        }
        match next_event(&mut rx).await {
            SessionEvent::AuthorizationRequired { session_id, auth_url, .. } => {
                assert_eq!(session_id, reply.session_id);
                assert!(auth_url.starts_with("https://auth.example.com/authorize"));
            }
            other => panic!("expected staged authorization, got {other:?}"),
        }

        // Completing the new round brings the session all the way back.
        coordinator.finish_auth(reply.session_id, "good-code").await.unwrap();
        loop {
            if let SessionEvent::StateChanged { state: SessionState::Connected, .. } =
                next_event(&mut rx).await
            {
                break;
            }
        }
        let record = coordinator.snapshot(reply.session_id).await.unwrap();
        assert_eq!(record.state, SessionState::Connected);
        assert_eq!(record.auth_tokens.expect("new grant").access_token, "access-1");
    }
}
