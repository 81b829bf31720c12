//! OAuth discovery documents served by the proxy
//!
//! Implements RFC 8414 (Authorization Server Metadata) and RFC 9728
//! (Protected Resource Metadata).

use axum::http::{HeaderMap, header};
use serde::{Deserialize, Deserializer, Serialize};

use crate::gateway::route::{AUTHORIZE_PATH, REGISTER_PATH, TOKEN_PATH};

/// OAuth Authorization Server Metadata (RFC 8414)
///
/// Also the shape of the `auth_server.paths.<well-known>.response` template,
/// so every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Key set for token signatures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Dynamic client registration endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    /// Supported response types
    pub response_types_supported: Vec<String>,

    /// Supported grant types
    pub grant_types_supported: Vec<String>,

    /// Supported token endpoint auth methods
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported PKCE code challenge methods
    pub code_challenge_methods_supported: Vec<String>,

    /// Supported scopes (may be string or array in hand-written templates)
    #[serde(
        deserialize_with = "deserialize_scopes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub scopes_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    /// Point unset endpoints at the proxy itself
    #[must_use]
    pub fn with_proxy_endpoints(mut self, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        if self.authorization_endpoint.is_empty() {
            self.authorization_endpoint = format!("{base}{AUTHORIZE_PATH}");
        }
        if self.token_endpoint.is_empty() {
            self.token_endpoint = format!("{base}{TOKEN_PATH}");
        }
        if self.registration_endpoint.as_deref().is_none_or(str::is_empty) {
            self.registration_endpoint = Some(format!("{base}{REGISTER_PATH}"));
        }
        if self.token_endpoint_auth_methods_supported.is_empty() {
            self.token_endpoint_auth_methods_supported = vec!["client_secret_basic".to_string()];
        }
        self
    }
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Audience tokens must carry
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub audience: String,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Scopes a client may request
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Key set for token signatures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Supported bearer token methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bearer_methods_supported: Vec<String>,
}

/// Deserialize scopes that may be either a string or array
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

/// Public base URL the client used to reach the proxy.
///
/// Honors `X-Forwarded-Proto` and `X-Forwarded-Host` (first value of each)
/// before falling back to `Host`.
pub fn public_base_url(headers: &HeaderMap) -> String {
    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let scheme = first("x-forwarded-proto").unwrap_or("http");
    let host = first("x-forwarded-host")
        .or_else(|| first(header::HOST.as_str()))
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}
