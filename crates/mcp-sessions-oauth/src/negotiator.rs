//! Authorization-code exchange and token refresh.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use mcp_sessions_core::config::SessionConfig;
use mcp_sessions_core::record::{AuthTokens, SessionId, now_epoch_s};

use crate::metadata::{AuthorizationServerMetadata, discover_authorization_server};
use crate::pkce::{PkcePair, random_state};

/// Access tokens are refreshed this many seconds before expiry.
const REFRESH_SAFETY_WINDOW_S: i64 = 60;

/// OAuth negotiation error.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("authorization metadata discovery failed: {0}")]
    Discovery(String),
    /// No verifier is pending for the session: either authorization was never
    /// begun, or the verifier was already consumed by a previous exchange.
    /// Deliberately distinct from [`OAuthError::CodeRejected`].
    #[error("no pending authorization for session {0}")]
    NoPendingAuthorization(SessionId),
    /// The authorization server rejected the code exchange.
    #[error("authorization code rejected ({status}): {body}")]
    CodeRejected { status: u16, body: String },
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("grant is missing its token endpoint; re-authorization required")]
    MissingTokenEndpoint,
    #[error("dynamic client registration failed: {0}")]
    Registration(String),
    #[error("authorization transport error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for OAuthError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// What a server demands before sessions can be opened against it.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
    pub issuer: Option<String>,
    pub scope: Option<String>,
}

impl AuthChallenge {
    fn from_metadata(metadata: AuthorizationServerMetadata) -> Option<Self> {
        Some(Self {
            authorization_endpoint: metadata.authorization_endpoint?,
            token_endpoint: metadata.token_endpoint?,
            registration_endpoint: metadata.registration_endpoint,
            issuer: metadata.issuer,
            scope: metadata
                .scopes_supported
                .filter(|scopes| !scopes.is_empty())
                .map(|scopes| scopes.join(" ")),
        })
    }
}

/// Trait seam the session registry drives authorization through.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Determine whether the server requires authorization.
    async fn probe(&self, server_url: &str) -> Result<Option<AuthChallenge>, OAuthError>;

    /// Begin an authorization round: retain a single-use verifier and return
    /// the authorization URL to surface to the caller.
    async fn begin(
        &self,
        session_id: SessionId,
        challenge: &AuthChallenge,
        callback_url: &str,
    ) -> Result<String, OAuthError>;

    /// Exchange an authorization code for tokens, consuming the pending
    /// verifier.
    async fn finish(&self, session_id: SessionId, code: &str) -> Result<AuthTokens, OAuthError>;

    /// Exchange a refresh token for fresh tokens.
    async fn refresh(&self, tokens: &AuthTokens) -> Result<AuthTokens, OAuthError>;

    /// Drop any pending authorization for the session.
    async fn cancel(&self, session_id: SessionId);
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientRegistrationResponse {
    client_id: String,
}

struct PendingAuthorization {
    verifier: String,
    token_endpoint: String,
    client_id: Option<String>,
    redirect_uri: String,
}

/// PKCE authorization-code negotiator over HTTP.
pub struct OAuthNegotiator {
    http: reqwest::Client,
    request_timeout: Duration,
    /// Pre-registered client id; when absent, dynamic registration is
    /// attempted against servers that advertise a registration endpoint.
    static_client_id: Option<String>,
    pending: Mutex<HashMap<SessionId, PendingAuthorization>>,
    completions: Mutex<HashMap<SessionId, oneshot::Sender<AuthTokens>>>,
}

impl OAuthNegotiator {
    /// Create a negotiator with a dedicated HTTP client.
    #[must_use]
    pub fn new(request_timeout: Duration, static_client_id: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            request_timeout,
            static_client_id,
            pending: Mutex::new(HashMap::new()),
            completions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a negotiator whose token-exchange requests time out per the
    /// session configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig, static_client_id: Option<String>) -> Self {
        Self::new(config.token_exchange_timeout, static_client_id)
    }

    /// One-shot future resolved when `finish` succeeds for the session.
    ///
    /// Lets an authorization-callback handler hand the result back to the
    /// initiating caller without any ambient side channel.
    pub async fn subscribe_completion(
        &self,
        session_id: SessionId,
    ) -> oneshot::Receiver<AuthTokens> {
        let (tx, rx) = oneshot::channel();
        self.completions.lock().await.insert(session_id, tx);
        rx
    }

    async fn register_client(&self, registration_endpoint: &str) -> Result<String, OAuthError> {
        let response = self
            .http
            .post(registration_endpoint)
            .timeout(self.request_timeout)
            .json(&serde_json::json!({
                "client_name": "mcp-sessions",
                "grant_types": ["authorization_code", "refresh_token"],
                "response_types": ["code"],
                "token_endpoint_auth_method": "none",
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Registration(format!("{status}: {body}")));
        }
        let registered = response.json::<ClientRegistrationResponse>().await?;
        Ok(registered.client_id)
    }
}

impl Default for OAuthNegotiator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), None)
    }
}

#[async_trait]
impl Authorizer for OAuthNegotiator {
    async fn probe(&self, server_url: &str) -> Result<Option<AuthChallenge>, OAuthError> {
        let metadata = discover_authorization_server(&self.http, server_url).await?;
        Ok(metadata.and_then(AuthChallenge::from_metadata))
    }

    async fn begin(
        &self,
        session_id: SessionId,
        challenge: &AuthChallenge,
        callback_url: &str,
    ) -> Result<String, OAuthError> {
        let client_id = match &self.static_client_id {
            Some(id) => Some(id.clone()),
            None => match challenge.registration_endpoint.as_deref() {
                Some(endpoint) => Some(self.register_client(endpoint).await?),
                None => None,
            },
        };

        let pkce = PkcePair::generate();
        let state = random_state();
        let mut url = reqwest::Url::parse(&challenge.authorization_endpoint)
            .map_err(|err| OAuthError::Discovery(format!("bad authorization endpoint: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", callback_url)
                .append_pair("state", &state)
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(client_id) = client_id.as_deref() {
                query.append_pair("client_id", client_id);
            }
            if let Some(scope) = challenge.scope.as_deref() {
                query.append_pair("scope", scope);
            }
        }

        debug!(%session_id, endpoint = %challenge.authorization_endpoint, "authorization round started");
        self.pending.lock().await.insert(
            session_id,
            PendingAuthorization {
                verifier: pkce.verifier,
                token_endpoint: challenge.token_endpoint.clone(),
                client_id,
                redirect_uri: callback_url.to_string(),
            },
        );

        Ok(url.to_string())
    }

    async fn finish(&self, session_id: SessionId, code: &str) -> Result<AuthTokens, OAuthError> {
        // take() makes the verifier single-use: a second exchange for the
        // same round fails before any network traffic.
        let pending = self
            .pending
            .lock()
            .await
            .remove(&session_id)
            .ok_or(OAuthError::NoPendingAuthorization(session_id))?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("code_verifier", pending.verifier),
            ("redirect_uri", pending.redirect_uri),
        ];
        if let Some(client_id) = pending.client_id.clone() {
            form.push(("client_id", client_id));
        }

        let response = self
            .http
            .post(&pending.token_endpoint)
            .timeout(self.request_timeout)
            .form(&form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(%session_id, status, "authorization code exchange rejected");
            return Err(OAuthError::CodeRejected { status, body });
        }

        let token = response.json::<TokenResponse>().await?;
        let tokens = AuthTokens {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .and_then(|seconds| now_epoch_s().checked_add(seconds)),
            token_endpoint: Some(pending.token_endpoint),
            client_id: pending.client_id,
        };

        if let Some(tx) = self.completions.lock().await.remove(&session_id) {
            let _ = tx.send(tokens.clone());
        }
        Ok(tokens)
    }

    async fn refresh(&self, tokens: &AuthTokens) -> Result<AuthTokens, OAuthError> {
        let token_endpoint = tokens
            .token_endpoint
            .as_deref()
            .ok_or(OAuthError::MissingTokenEndpoint)?;
        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| OAuthError::RefreshFailed("no refresh token on grant".to_string()))?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = tokens.client_id.clone() {
            form.push(("client_id", client_id));
        }

        let response = self
            .http
            .post(token_endpoint)
            .timeout(self.request_timeout)
            .form(&form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::RefreshFailed(format!("{status}: {body}")));
        }

        let token = response.json::<TokenResponse>().await?;
        Ok(apply_token_response(tokens, token, now_epoch_s()))
    }

    async fn cancel(&self, session_id: SessionId) {
        self.pending.lock().await.remove(&session_id);
        self.completions.lock().await.remove(&session_id);
    }
}

/// Whether a proactive refresh should run before using the tokens.
#[must_use]
pub fn should_refresh(tokens: &AuthTokens, now_epoch_s: i64) -> bool {
    tokens.needs_refresh(now_epoch_s, REFRESH_SAFETY_WINDOW_S)
}

/// Merge a token response into an existing grant, keeping fields the server
/// chose not to resend.
fn apply_token_response(existing: &AuthTokens, token: TokenResponse, now_epoch_s: i64) -> AuthTokens {
    AuthTokens {
        access_token: token.access_token,
        refresh_token: token.refresh_token.or_else(|| existing.refresh_token.clone()),
        expires_at: token
            .expires_in
            .and_then(|seconds| now_epoch_s.checked_add(seconds)),
        token_endpoint: existing.token_endpoint.clone(),
        client_id: existing.client_id.clone(),
    }
}
