//! Session registry: the single authority over one session's lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use mcp_sessions_core::config::SessionConfig;
use mcp_sessions_core::error::SessionError;
use mcp_sessions_core::events::EventNotifier;
use mcp_sessions_core::record::{
    FaultKind, SessionFault, SessionId, SessionRecord, SessionState, TransportKind, now_epoch_s,
};
use mcp_sessions_core::store::{SessionStore, StoreError};
use mcp_sessions_oauth::negotiator::{Authorizer, OAuthError, should_refresh};
use mcp_sessions_transport::channel::{ChannelFactory, ToolChannel, TransportError};

/// Shared collaborators, constructed once at process start and passed by
/// reference to every registry. The test seam is this struct: substitute any
/// field with a double.
pub struct SessionEnv {
    pub store: Arc<dyn SessionStore>,
    pub channels: Arc<dyn ChannelFactory>,
    pub authorizer: Arc<dyn Authorizer>,
    pub notifier: Arc<EventNotifier>,
    pub config: SessionConfig,
}

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Explicit id; `None` generates one. Two concurrent connects with the
    /// same explicit id race through the store, and the loser gets a
    /// conflict.
    pub session_id: Option<SessionId>,
    pub identity: String,
    pub server_id: String,
    pub server_name: String,
    pub server_url: String,
    pub callback_url: String,
    pub preferred_transport: Option<TransportKind>,
}

struct Active {
    record: SessionRecord,
    channel: Option<Box<dyn ToolChannel>>,
}

/// Single authority for one session's state machine.
///
/// Commands lock `active`, so they apply one at a time per session;
/// operations on different sessions proceed fully concurrently. Spawned work
/// (dial, discovery, retries) carries the generation observed at spawn time
/// and is dropped once `disconnect` bumps it.
pub struct SessionRegistry {
    env: Arc<SessionEnv>,
    session_id: SessionId,
    active: Mutex<Active>,
    generation: AtomicU64,
}

impl SessionRegistry {
    /// Open a new session: create the record (first writer wins), then either
    /// surface an authorization URL or start dialing in the background.
    ///
    /// # Errors
    /// Returns [`SessionError::Conflict`] when a live record already exists
    /// for an explicit id, or the classified failure of the authorization
    /// probe.
    pub async fn open(
        env: Arc<SessionEnv>,
        params: ConnectParams,
    ) -> Result<(Arc<Self>, Option<String>), SessionError> {
        let session_id = params.session_id.unwrap_or_else(SessionId::new_v4);
        let mut record = SessionRecord::new(
            session_id,
            params.identity,
            params.server_id,
            params.server_name,
            params.server_url,
        );
        record.transport = params.preferred_transport;
        record.callback_url = Some(params.callback_url.clone());

        insert_with_retry(&env, &record).await?;

        let registry = Arc::new(Self {
            env,
            session_id,
            active: Mutex::new(Active { record, channel: None }),
            generation: AtomicU64::new(0),
        });
        registry
            .env
            .notifier
            .emit_state(session_id, SessionState::Connecting);
        info!(%session_id, "session opened");

        let server_url = registry.active.lock().await.record.server_url.clone();
        match registry.env.authorizer.probe(&server_url).await {
            Ok(Some(challenge)) => {
                let auth_url = registry
                    .env
                    .authorizer
                    .begin(session_id, &challenge, &params.callback_url)
                    .await
                    .map_err(classify_oauth);
                match auth_url {
                    Ok(auth_url) => {
                        registry.apply(0, SessionState::Authenticating, None).await?;
                        Ok((registry, Some(auth_url)))
                    }
                    Err(err) => {
                        registry.fail(0, &err).await;
                        Err(err)
                    }
                }
            }
            Ok(None) => {
                registry.spawn_establish(0, false);
                Ok((registry, None))
            }
            Err(err) => {
                let err = classify_oauth(err);
                registry.fail(0, &err).await;
                Err(err)
            }
        }
    }

    /// Rebuild a registry around a record found in the store at startup.
    #[must_use]
    pub fn restore(env: Arc<SessionEnv>, record: SessionRecord) -> Arc<Self> {
        let session_id = record.session_id;
        Arc::new(Self {
            env,
            session_id,
            active: Mutex::new(Active { record, channel: None }),
            generation: AtomicU64::new(0),
        })
    }

    /// Start validating a restored session in the background.
    pub fn spawn_validate(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let generation = registry.generation();
        tokio::spawn(async move {
            if matches!(
                registry.apply(generation, SessionState::Validating, None).await,
                Ok(true)
            ) {
                registry.establish(generation, true).await;
            }
        });
    }

    /// Session id this registry owns.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.session_id
    }

    /// Clone of the current record.
    pub async fn snapshot(&self) -> SessionRecord {
        self.active.lock().await.record.clone()
    }

    /// Exchange an authorization code for tokens and resume connecting.
    ///
    /// Legal while `AUTHENTICATING`, or after an authorization-kind failure
    /// (a late-arriving code is routed by the fault's kind tag, never by its
    /// message text).
    ///
    /// # Errors
    /// Authorization failures are terminal for this round: the session moves
    /// to `FAILED` and a fresh `connect` is required.
    pub async fn finish_auth(self: &Arc<Self>, code: &str) -> Result<(), SessionError> {
        let generation = self.generation();
        let mut active = self.active.lock().await;
        let auth_pending = active.record.state == SessionState::Authenticating
            || (active.record.state == SessionState::Failed
                && active
                    .record
                    .error
                    .as_ref()
                    .is_some_and(|fault| fault.kind == FaultKind::Auth));
        if !auth_pending {
            return Err(SessionError::NotReady(active.record.state));
        }

        match self.env.authorizer.finish(self.session_id, code).await {
            Ok(tokens) => {
                active.record.auth_tokens = Some(tokens);
                active.record.state = SessionState::Authenticated;
                active.record.touch();
                self.persist(&active.record).await?;
                self.env
                    .notifier
                    .emit_state(self.session_id, SessionState::Authenticated);
                drop(active);
                self.spawn_establish(generation, false);
                Ok(())
            }
            Err(err) => {
                let err = classify_oauth(err);
                let fault = SessionFault { message: err.to_string(), kind: err.kind() };
                active.record.state = SessionState::Failed;
                active.record.error = Some(fault.clone());
                self.persist(&active.record).await?;
                self.env
                    .notifier
                    .emit_state(self.session_id, SessionState::Failed);
                self.env
                    .notifier
                    .emit_error(self.session_id, fault.message, fault.kind);
                Err(err)
            }
        }
    }

    /// Invoke a remote tool. Legal only while `CONNECTED`.
    ///
    /// # Errors
    /// Fails with [`SessionError::NotReady`] outside `CONNECTED`; transport
    /// failures are reported, not retried.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value, SessionError> {
        let mut active = self.active.lock().await;
        if active.record.state != SessionState::Connected {
            return Err(SessionError::NotReady(active.record.state));
        }

        // Proactive refresh: never send a token we know is about to lapse.
        if let Some(tokens) = active.record.auth_tokens.clone() {
            if should_refresh(&tokens, now_epoch_s()) {
                match self.env.authorizer.refresh(&tokens).await {
                    Ok(fresh) => {
                        if let Some(channel) = active.channel.as_mut() {
                            channel.set_bearer_token(Some(fresh.access_token.clone()));
                        }
                        active.record.auth_tokens = Some(fresh);
                        self.persist(&active.record).await?;
                    }
                    Err(OAuthError::Http(msg)) => {
                        // The token endpoint was unreachable, not the grant
                        // rejected. Keep the tokens and let the caller retry.
                        return Err(SessionError::Transient(format!(
                            "token refresh unreachable: {msg}"
                        )));
                    }
                    Err(err) => {
                        // The grant is dead: invalidate it, demand a new
                        // authorization round and stage it right away so a
                        // later `finish_auth` has a verifier to consume.
                        let err = SessionError::Auth(format!("token refresh failed: {err}"));
                        let fault =
                            SessionFault { message: err.to_string(), kind: FaultKind::Auth };
                        active.record.auth_tokens = None;
                        active.record.state = SessionState::Authenticating;
                        active.record.error = Some(fault.clone());
                        let auth_url = self.stage_reauthorization(&active.record).await;
                        self.persist(&active.record).await?;
                        self.env
                            .notifier
                            .emit_state(self.session_id, SessionState::Authenticating);
                        self.env
                            .notifier
                            .emit_error(self.session_id, fault.message, fault.kind);
                        if let Some(auth_url) = auth_url {
                            self.env
                                .notifier
                                .emit_auth_required(self.session_id, auth_url);
                        }
                        return Err(err);
                    }
                }
            }
        }

        let channel = active
            .channel
            .as_mut()
            .ok_or_else(|| SessionError::Transient("transport channel not open".to_string()))?;
        match channel.call_tool(name, args).await {
            Ok(result) => {
                active.record.touch();
                self.persist(&active.record).await?;
                Ok(result)
            }
            Err(err) => {
                let err = classify_transport(&err);
                let fault = SessionFault { message: err.to_string(), kind: err.kind() };
                active.record.error = Some(fault.clone());
                self.persist(&active.record).await?;
                self.env
                    .notifier
                    .emit_error(self.session_id, fault.message, fault.kind);
                Err(err)
            }
        }
    }

    /// Tear the session down. Legal from any state and idempotent.
    ///
    /// Bumps the generation first, so an in-flight connect cannot resurrect
    /// the session afterwards.
    ///
    /// # Errors
    /// Only a storage outage that survives the retry budget is escalated.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut active = self.active.lock().await;
        self.env.authorizer.cancel(self.session_id).await;
        active.channel = None;
        active.record.state = SessionState::Disconnected;
        active.record.generation = generation;

        remove_with_retry(&self.env, self.session_id).await?;
        self.env
            .notifier
            .emit_state(self.session_id, SessionState::Disconnected);
        info!(session_id = %self.session_id, "session disconnected");
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation() != generation
    }

    fn spawn_establish(self: &Arc<Self>, generation: u64, restoring: bool) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.establish(generation, restoring).await;
        });
    }

    /// Dial and discover, retrying transient failures with backoff until the
    /// budget runs out.
    async fn establish(&self, generation: u64, restoring: bool) {
        let mut retry = 0_u32;
        loop {
            match self.try_establish(generation, restoring).await {
                Ok(()) => return,
                Err(err) if err.is_transient() && self.env.config.retry.retries_left(retry) => {
                    let delay = self.env.config.retry.delay_for(retry);
                    retry += 1;
                    debug!(
                        session_id = %self.session_id,
                        %err,
                        retry,
                        ?delay,
                        "transient failure, reconnect scheduled"
                    );
                    let fault = SessionFault { message: err.to_string(), kind: err.kind() };
                    match self
                        .apply(generation, SessionState::Reconnecting, Some(fault))
                        .await
                    {
                        Ok(true) => tokio::time::sleep(delay).await,
                        // Superseded or storage gone: stop quietly.
                        _ => return,
                    }
                }
                Err(err) => {
                    self.fail(generation, &err).await;
                    return;
                }
            }
        }
    }

    async fn try_establish(&self, generation: u64, restoring: bool) -> Result<(), SessionError> {
        let (server_url, bearer_token, reuse_tools) = {
            let active = self.active.lock().await;
            if self.is_stale(generation) {
                return Ok(());
            }
            let fresh_window = self.env.config.tool_freshness.as_secs() as i64;
            let reuse = restoring
                && !active.record.tools.is_empty()
                && now_epoch_s() - active.record.last_activity <= fresh_window;
            (
                active.record.server_url.clone(),
                active
                    .record
                    .auth_tokens
                    .as_ref()
                    .map(|tokens| tokens.access_token.clone()),
                reuse,
            )
        };

        let mut channel = tokio::time::timeout(
            self.env.config.dial_timeout,
            self.env.channels.dial(&server_url, bearer_token.as_deref()),
        )
        .await
        .map_err(|_| SessionError::Transient("transport dial timed out".to_string()))?
        .map_err(|err| classify_transport(&err))?;

        let info = tokio::time::timeout(self.env.config.dial_timeout, channel.initialize())
            .await
            .map_err(|_| SessionError::Transient("initialize handshake timed out".to_string()))?
            .map_err(|err| classify_transport(&err))?;

        let tools = if reuse_tools {
            // Catalog is fresh enough; a liveness probe is all validation needs.
            tokio::time::timeout(self.env.config.dial_timeout, channel.probe())
                .await
                .map_err(|_| SessionError::Transient("liveness probe timed out".to_string()))?
                .map_err(|err| classify_transport(&err))?;
            None
        } else {
            if !restoring
                && !self
                    .apply(generation, SessionState::Discovering, None)
                    .await?
            {
                return Ok(());
            }
            let tools =
                tokio::time::timeout(self.env.config.discovery_timeout, channel.list_tools())
                    .await
                    .map_err(|_| SessionError::Transient("tool discovery timed out".to_string()))?
                    .map_err(|err| classify_transport(&err))?;
            Some(tools)
        };

        let mut active = self.active.lock().await;
        if self.is_stale(generation) {
            // A disconnect superseded this dial; the channel dies here.
            return Ok(());
        }
        active.record.transport = Some(info.kind);
        if let Some(tools) = tools {
            active.record.tools = tools;
        }
        active.record.state = SessionState::Connected;
        active.record.touch();
        self.persist(&active.record).await?;
        if !reuse_tools {
            self.env
                .notifier
                .emit_tools(self.session_id, active.record.tools.clone());
        }
        self.env
            .notifier
            .emit_state(self.session_id, SessionState::Connected);
        active.channel = Some(channel);
        info!(
            session_id = %self.session_id,
            transport = ?info.kind,
            tools = active.record.tools.len(),
            "session connected"
        );
        Ok(())
    }

    /// Move to `state`, persist and emit. Returns `false` when `generation`
    /// is stale, in which case nothing happened.
    async fn apply(
        &self,
        generation: u64,
        state: SessionState,
        fault: Option<SessionFault>,
    ) -> Result<bool, SessionError> {
        let mut active = self.active.lock().await;
        if self.is_stale(generation) {
            return Ok(false);
        }
        active.record.state = state;
        if let Some(fault) = fault {
            active.record.error = Some(fault);
        }
        self.persist(&active.record).await?;
        self.env.notifier.emit_state(self.session_id, state);
        Ok(true)
    }

    async fn fail(&self, generation: u64, err: &SessionError) {
        let fault = SessionFault { message: err.to_string(), kind: err.kind() };
        warn!(session_id = %self.session_id, %err, "session failed");
        if matches!(
            self.apply(generation, SessionState::Failed, Some(fault.clone()))
                .await,
            Ok(true)
        ) {
            self.env
                .notifier
                .emit_error(self.session_id, fault.message, fault.kind);
        }
    }

    /// Stage a fresh authorization round after a grant died, so the session
    /// is actionable from `AUTHENTICATING` rather than a dead end. Returns
    /// the new authorization URL when the server still demands one.
    async fn stage_reauthorization(&self, record: &SessionRecord) -> Option<String> {
        let callback_url = record.callback_url.clone()?;
        let challenge = self.env.authorizer.probe(&record.server_url).await.ok()??;
        self.env
            .authorizer
            .begin(self.session_id, &challenge, &callback_url)
            .await
            .ok()
    }

    /// Persist the record, retrying backend outages with backoff. Escalates
    /// only once the retry budget is exhausted.
    async fn persist(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let mut retry = 0_u32;
        loop {
            match self
                .env
                .store
                .update(record, self.env.config.session_ttl)
                .await
            {
                Ok(()) => return Ok(()),
                Err(StoreError::Backend(msg)) if self.env.config.retry.retries_left(retry) => {
                    warn!(session_id = %record.session_id, %msg, retry, "storage write failed, retrying");
                    tokio::time::sleep(self.env.config.retry.delay_for(retry)).await;
                    retry += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

async fn insert_with_retry(env: &SessionEnv, record: &SessionRecord) -> Result<(), SessionError> {
    let mut retry = 0_u32;
    loop {
        match env.store.insert(record, env.config.session_ttl).await {
            Ok(()) => return Ok(()),
            Err(StoreError::Backend(msg)) if env.config.retry.retries_left(retry) => {
                warn!(session_id = %record.session_id, %msg, retry, "storage insert failed, retrying");
                tokio::time::sleep(env.config.retry.delay_for(retry)).await;
                retry += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn remove_with_retry(env: &SessionEnv, id: SessionId) -> Result<(), SessionError> {
    let mut retry = 0_u32;
    loop {
        match env.store.remove(id).await {
            Ok(()) => return Ok(()),
            Err(StoreError::Backend(msg)) if env.config.retry.retries_left(retry) => {
                warn!(session_id = %id, %msg, retry, "storage delete failed, retrying");
                tokio::time::sleep(env.config.retry.delay_for(retry)).await;
                retry += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn classify_transport(err: &TransportError) -> SessionError {
    if err.is_auth() {
        SessionError::Auth(err.to_string())
    } else if err.is_transient() {
        SessionError::Transient(err.to_string())
    } else {
        SessionError::Protocol(err.to_string())
    }
}

fn classify_oauth(err: OAuthError) -> SessionError {
    match err {
        OAuthError::Http(msg) => SessionError::Transient(msg),
        OAuthError::Discovery(msg) => SessionError::Protocol(msg),
        other => SessionError::Auth(other.to_string()),
    }
}
