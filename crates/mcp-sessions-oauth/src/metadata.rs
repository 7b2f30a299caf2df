//! Well-known authorization-server metadata discovery.

use serde::Deserialize;

use crate::negotiator::OAuthError;

/// Authorization-server metadata (RFC 8414 subset).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub issuer: Option<String>,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Option<Vec<String>>,
    /// Protected-resource metadata delegates to these issuers.
    #[serde(default)]
    pub authorization_servers: Option<Vec<String>>,
}

impl AuthorizationServerMetadata {
    fn is_usable(&self) -> bool {
        self.authorization_endpoint.is_some() && self.token_endpoint.is_some()
    }
}

/// Probe a server's origin for authorization metadata.
///
/// Tries the oauth-authorization-server, openid-configuration and
/// oauth-protected-resource well-known documents in order, following one
/// level of authorization-server delegation. `Ok(None)` means the server
/// advertises no authorization requirement.
///
/// # Errors
/// Returns an error only when the server URL itself cannot be parsed;
/// unreachable or malformed metadata documents are skipped.
pub async fn discover_authorization_server(
    http: &reqwest::Client,
    server_url: &str,
) -> Result<Option<AuthorizationServerMetadata>, OAuthError> {
    if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        return Ok(None);
    }
    let url = reqwest::Url::parse(server_url)
        .map_err(|err| OAuthError::Discovery(format!("invalid server url: {err}")))?;
    let origin = url
        .host_str()
        .map(|host| match url.port() {
            Some(port) => format!("{}://{host}:{port}", url.scheme()),
            None => format!("{}://{host}", url.scheme()),
        })
        .ok_or_else(|| OAuthError::Discovery("server url has no host".to_string()))?;

    let candidates = [
        format!("{origin}/.well-known/oauth-authorization-server"),
        format!("{origin}/.well-known/openid-configuration"),
        format!("{origin}/.well-known/oauth-protected-resource"),
    ];

    for candidate in candidates {
        let Some(metadata) = fetch_metadata(http, &candidate).await else {
            continue;
        };
        if metadata.is_usable() {
            return Ok(Some(metadata));
        }
        if let Some(issuers) = metadata.authorization_servers.as_ref() {
            for issuer in issuers {
                let issuer = issuer.trim_end_matches('/');
                let delegated_url = format!("{issuer}/.well-known/oauth-authorization-server");
                if let Some(mut delegated) = fetch_metadata(http, &delegated_url).await {
                    if delegated.issuer.is_none() {
                        delegated.issuer = Some(issuer.to_string());
                    }
                    if delegated.is_usable() {
                        return Ok(Some(delegated));
                    }
                }
            }
        }
    }

    Ok(None)
}

async fn fetch_metadata(
    http: &reqwest::Client,
    url: &str,
) -> Option<AuthorizationServerMetadata> {
    let response = http.get(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<AuthorizationServerMetadata>().await.ok()
}
