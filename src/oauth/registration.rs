//! Dynamic client registration for managed identity providers
//!
//! The provider has no RFC 7591 endpoint, so the proxy mints the client
//! credentials itself and creates a matching OIDC application through the
//! tenant's management API using an admin token.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;

/// Scopes the admin client needs for application management
const ADMIN_SCOPES: &str = "internal_application_mgt_create internal_application_mgt_delete \
                            internal_application_mgt_update internal_application_mgt_view";

/// Registration failure, split by who is at fault
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The client sent an unusable request (400)
    #[error("invalid registration request: {0}")]
    InvalidRequest(String),
    /// The provider rejected or failed a call (502)
    #[error("provider error: {0}")]
    Provider(String),
}

/// RFC 7591 registration request (subset)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientRegistrationRequest {
    /// Human-readable client name
    pub client_name: String,
    /// Redirect URIs; at least one is required
    pub redirect_uris: Vec<String>,
    /// Requested grant types
    pub grant_types: Vec<String>,
    /// Requested response types
    pub response_types: Vec<String>,
}

/// RFC 7591 registration response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    /// Issued client id
    pub client_id: String,
    /// Issued client secret
    pub client_secret: String,
    /// Client name as registered
    pub client_name: String,
    /// Registered redirect URIs
    pub redirect_uris: Vec<String>,
    /// Granted grant types
    pub grant_types: Vec<String>,
    /// Granted response types
    pub response_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AdminToken {
    access_token: String,
}

/// Registers clients as applications in a managed tenant
#[derive(Debug, Clone)]
pub struct ManagedRegistrar {
    http: Client,
    token_url: String,
    applications_url: String,
    admin_client_id: String,
    admin_client_secret: String,
}

impl ManagedRegistrar {
    /// Build from the managed provider settings
    pub fn from_config(config: &Config, http: Client) -> Self {
        let managed = &config.auth_server.managed;
        Self {
            http,
            token_url: format!("{}/token", config.auth_server.base_url.trim_end_matches('/')),
            applications_url: format!(
                "{}/api/server/v1/applications",
                managed.tenant_url.trim_end_matches('/')
            ),
            admin_client_id: managed.client_id.clone(),
            admin_client_secret: managed.client_secret.clone(),
        }
    }

    /// Register a client and return its credentials
    ///
    /// # Errors
    ///
    /// [`RegistrationError::InvalidRequest`] when no redirect URI is given;
    /// [`RegistrationError::Provider`] when the admin token or the
    /// application cannot be obtained.
    pub async fn register(
        &self,
        mut request: ClientRegistrationRequest,
    ) -> Result<ClientRegistrationResponse, RegistrationError> {
        if request.redirect_uris.is_empty() {
            return Err(RegistrationError::InvalidRequest(
                "redirect_uris is required".to_string(),
            ));
        }
        if request.grant_types.is_empty() {
            request.grant_types = vec!["authorization_code".into(), "refresh_token".into()];
        }
        if request.response_types.is_empty() {
            request.response_types = vec!["code".into()];
        }

        let client_id = format!("client-{}", &random_token()[..8]);
        let client_secret = random_token()[..16].to_string();
        let base_name = if request.client_name.is_empty() {
            "mcp-client"
        } else {
            request.client_name.as_str()
        };
        let app_name = format!("{base_name}-{}", &random_token()[..5]);

        let token = self.admin_token().await?;
        self.create_application(&token, &app_name, &client_id, &client_secret, &request)
            .await?;

        info!(client_id = %client_id, app = %app_name, "Registered OAuth client");
        Ok(ClientRegistrationResponse {
            client_id,
            client_secret,
            client_name: request.client_name,
            redirect_uris: request.redirect_uris,
            grant_types: request.grant_types,
            response_types: request.response_types,
        })
    }

    async fn admin_token(&self) -> Result<String, RegistrationError> {
        debug!(url = %self.token_url, "Requesting admin token");
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.admin_client_id, Some(&self.admin_client_secret))
            .form(&[("grant_type", "client_credentials"), ("scope", ADMIN_SCOPES)])
            .send()
            .await
            .map_err(|e| RegistrationError::Provider(format!("admin token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RegistrationError::Provider(format!(
                "admin token request failed: HTTP {status} - {body}"
            )));
        }

        let token: AdminToken = response
            .json()
            .await
            .map_err(|e| RegistrationError::Provider(format!("invalid admin token response: {e}")))?;
        Ok(token.access_token)
    }

    async fn create_application(
        &self,
        admin_token: &str,
        name: &str,
        client_id: &str,
        client_secret: &str,
        request: &ClientRegistrationRequest,
    ) -> Result<(), RegistrationError> {
        let payload = json!({
            "name": name,
            "templateId": "custom-application-oidc",
            "inboundProtocolConfiguration": {
                "oidc": {
                    "clientId": client_id,
                    "clientSecret": client_secret,
                    "grantTypes": request.grant_types,
                    "callbackURLs": request.redirect_uris,
                    "allowedOrigins": [],
                    "publicClient": false,
                    "pkce": {
                        "mandatory": true,
                        "supportPlainTransformAlgorithm": true
                    },
                    "accessToken": {
                        "type": "JWT",
                        "userAccessTokenExpiryInSeconds": 3600,
                        "applicationAccessTokenExpiryInSeconds": 3600
                    }
                }
            }
        });

        let response = self
            .http
            .post(&self.applications_url)
            .bearer_auth(admin_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RegistrationError::Provider(format!("application create failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RegistrationError::Provider(format!(
                "application create failed: HTTP {status} - {body}"
            )));
        }
        Ok(())
    }
}

/// 32 lowercase hex characters
fn random_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderMode;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registrar(server: &MockServer) -> ManagedRegistrar {
        let mut config = Config::default();
        config.auth_server.mode = ProviderMode::Managed;
        config.auth_server.managed.tenant_url = format!("{}/t/acme", server.uri());
        config.auth_server.managed.client_id = "admin".into();
        config.auth_server.managed.client_secret = "s3cret".into();
        config.apply_defaults();
        ManagedRegistrar::from_config(&config, Client::new())
    }

    #[tokio::test]
    async fn register_creates_application_with_admin_token() {
        // GIVEN: a tenant that issues an admin token and accepts applications
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/t/acme/oauth2/token"))
            .and(header("authorization", "Basic YWRtaW46czNjcmV0"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "adm"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/t/acme/api/server/v1/applications"))
            .and(header("authorization", "Bearer adm"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        // WHEN: a client registers
        let response = registrar(&server)
            .register(ClientRegistrationRequest {
                client_name: "inspector".into(),
                redirect_uris: vec!["http://localhost:6274/callback".into()],
                ..ClientRegistrationRequest::default()
            })
            .await
            .unwrap();

        // THEN: fresh credentials come back with defaulted grant types
        assert!(response.client_id.starts_with("client-"));
        assert_eq!(response.client_id.len(), "client-".len() + 8);
        assert_eq!(response.client_secret.len(), 16);
        assert_eq!(response.grant_types, vec!["authorization_code", "refresh_token"]);
        assert_eq!(response.response_types, vec!["code"]);

        let requests = server.received_requests().await.unwrap();
        let app: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        let oidc = &app["inboundProtocolConfiguration"]["oidc"];
        assert_eq!(oidc["clientId"], response.client_id.as_str());
        assert_eq!(oidc["callbackURLs"], json!(["http://localhost:6274/callback"]));
        assert!(app["name"].as_str().unwrap().starts_with("inspector-"));
    }

    #[tokio::test]
    async fn missing_redirect_uris_is_rejected_without_calls() {
        let server = MockServer::start().await;
        let err = registrar(&server)
            .register(ClientRegistrationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidRequest(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_token_failure_is_a_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/t/acme/oauth2/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = registrar(&server)
            .register(ClientRegistrationRequest {
                redirect_uris: vec!["http://localhost/cb".into()],
                ..ClientRegistrationRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Provider(_)));
    }
}
