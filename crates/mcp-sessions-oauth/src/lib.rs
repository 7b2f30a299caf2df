//! OAuth authorization-code negotiator for MCP sessions.
//!
//! Provides:
//! - `Authorizer` - Trait seam the session registry drives authorization through
//! - `OAuthNegotiator` - PKCE code exchange and proactive refresh over HTTP
//! - Well-known metadata discovery with authorization-server delegation

pub mod metadata;
pub mod negotiator;
pub mod pkce;

pub use metadata::{AuthorizationServerMetadata, discover_authorization_server};
pub use negotiator::{AuthChallenge, Authorizer, OAuthError, OAuthNegotiator};
pub use pkce::PkcePair;
