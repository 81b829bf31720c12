//! Identity provider front.
//!
//! Decides which discovery documents the proxy answers itself and which
//! auth-plane calls it handles instead of proxying.

use reqwest::Client;

use super::metadata::{AuthorizationServerMetadata, ProtectedResourceMetadata};
use super::registration::ManagedRegistrar;
use crate::config::{Config, ProviderMode, ResourceConfig};
use crate::gateway::route::AUTHORIZATION_SERVER_METADATA_PATH;

/// Per-mode provider behavior
#[derive(Debug, Clone)]
pub struct Provider {
    mode: ProviderMode,
    auth_base_url: String,
    jwks_url: String,
    template: Option<AuthorizationServerMetadata>,
    resource: ResourceConfig,
    registrar: Option<ManagedRegistrar>,
}

impl Provider {
    /// Build from configuration; `http` is shared with the other clients
    pub fn from_config(config: &Config, http: Client) -> Self {
        let registrar = (config.auth_server.mode == ProviderMode::Managed)
            .then(|| ManagedRegistrar::from_config(config, http));
        Self {
            mode: config.auth_server.mode,
            auth_base_url: config.auth_server.base_url.trim_end_matches('/').to_string(),
            jwks_url: config.auth_server.jwks_url.clone(),
            template: config
                .auth_server
                .paths
                .get(AUTHORIZATION_SERVER_METADATA_PATH)
                .and_then(|p| p.response.clone()),
            resource: config.resource.clone(),
            registrar,
        }
    }

    /// Provider mode
    pub fn mode(&self) -> ProviderMode {
        self.mode
    }

    /// Authorization server metadata to serve locally, or `None` to proxy
    /// the request to the authorization server.
    ///
    /// `base_url` is the proxy's public base URL for this request.
    pub fn authorization_metadata(&self, base_url: &str) -> Option<AuthorizationServerMetadata> {
        match self.mode {
            ProviderMode::Default => self
                .template
                .clone()
                .map(|template| template.with_proxy_endpoints(base_url)),
            ProviderMode::Managed => {
                let base = base_url.trim_end_matches('/');
                Some(AuthorizationServerMetadata {
                    issuer: format!("{}/token", self.auth_base_url),
                    jwks_uri: (!self.jwks_url.is_empty()).then(|| self.jwks_url.clone()),
                    response_types_supported: vec!["code".into()],
                    grant_types_supported: vec![
                        "authorization_code".into(),
                        "refresh_token".into(),
                    ],
                    code_challenge_methods_supported: vec!["plain".into(), "S256".into()],
                    ..AuthorizationServerMetadata::default()
                }
                .with_proxy_endpoints(base))
            }
        }
    }

    /// Protected resource metadata for this proxy
    pub fn protected_resource_metadata(&self, base_url: &str) -> ProtectedResourceMetadata {
        let resource = if self.resource.identifier.is_empty() {
            base_url.trim_end_matches('/').to_string()
        } else {
            self.resource.identifier.clone()
        };
        let authorization_servers = if self.resource.authorization_servers.is_empty() {
            vec![base_url.trim_end_matches('/').to_string()]
        } else {
            self.resource.authorization_servers.clone()
        };
        ProtectedResourceMetadata {
            resource,
            audience: self.resource.audience.clone(),
            authorization_servers,
            scopes_supported: self.resource.scopes_supported.clone(),
            jwks_uri: self.resource.jwks_uri.clone(),
            bearer_methods_supported: self.resource.bearer_methods_supported.clone(),
        }
    }

    /// Registrar for `/register`, when the proxy handles it itself
    pub fn registrar(&self) -> Option<&ManagedRegistrar> {
        self.registrar.as_ref()
    }
}
