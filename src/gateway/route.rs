//! Path classification: auth plane, MCP plane, or rejected

use std::collections::HashMap;

use axum::http::Method;

use crate::config::Config;

/// OAuth authorization endpoint
pub const AUTHORIZE_PATH: &str = "/authorize";
/// OAuth token endpoint
pub const TOKEN_PATH: &str = "/token";
/// Dynamic client registration endpoint
pub const REGISTER_PATH: &str = "/register";
/// RFC 8414 authorization server metadata
pub const AUTHORIZATION_SERVER_METADATA_PATH: &str = "/.well-known/oauth-authorization-server";
/// RFC 9728 protected resource metadata
pub const PROTECTED_RESOURCE_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";

/// Auth-plane endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEndpoint {
    /// `/authorize`
    Authorize,
    /// `/token`
    Token,
    /// `/register`
    Register,
    /// `/.well-known/oauth-authorization-server`
    AuthorizationServerMetadata,
    /// `/.well-known/oauth-protected-resource`
    ProtectedResourceMetadata,
    /// Provider-specific user flow under the user prefix
    UserFlow,
}

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Authorization flow, proxied to (or answered for) the auth server
    Auth(AuthEndpoint),
    /// MCP traffic for the backend
    Mcp {
        /// Long-lived stream: no request deadline
        streaming: bool,
        /// Path on the backend, relative to its base path
        backend_path: String,
    },
    /// Not served
    Rejected,
}

/// Static route table built once from configuration
#[derive(Debug, Clone)]
pub struct RouteTable {
    sse: String,
    messages: String,
    streamable_http: Option<String>,
    mapping: HashMap<String, String>,
    user_prefix: String,
}

impl RouteTable {
    /// Build from configuration
    pub fn from_config(config: &Config) -> Self {
        let paths = &config.backend.paths;
        Self {
            sse: paths.sse.clone(),
            messages: paths.messages.clone(),
            streamable_http: paths.streamable_http.clone().filter(|p| !p.is_empty()),
            mapping: config.backend.path_mapping.clone(),
            user_prefix: config.auth_server.user_path_prefix.clone(),
        }
    }

    /// Classify a request
    pub fn classify(&self, method: &Method, path: &str) -> Route {
        let auth = match path {
            AUTHORIZE_PATH => Some(AuthEndpoint::Authorize),
            TOKEN_PATH => Some(AuthEndpoint::Token),
            REGISTER_PATH => Some(AuthEndpoint::Register),
            AUTHORIZATION_SERVER_METADATA_PATH => Some(AuthEndpoint::AuthorizationServerMetadata),
            PROTECTED_RESOURCE_METADATA_PATH => Some(AuthEndpoint::ProtectedResourceMetadata),
            _ if !self.user_prefix.is_empty() && path.starts_with(&self.user_prefix) => {
                Some(AuthEndpoint::UserFlow)
            }
            _ => None,
        };
        if let Some(endpoint) = auth {
            return Route::Auth(endpoint);
        }

        if let Some(target) = self.mapping.get(path) {
            return Route::Mcp {
                streaming: under(target, &self.sse),
                backend_path: target.clone(),
            };
        }

        let streaming = if under(path, &self.sse) {
            true
        } else if under(path, &self.messages) {
            false
        } else if self.streamable_http.as_deref().is_some_and(|p| under(path, p)) {
            *method == Method::GET
        } else {
            return Route::Rejected;
        };

        Route::Mcp {
            streaming,
            backend_path: path.to_string(),
        }
    }
}

/// `path` is `base` or lies below it
fn under(path: &str, base: &str) -> bool {
    match path.strip_prefix(base) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || base.ends_with('/'),
        None => false,
    }
}
