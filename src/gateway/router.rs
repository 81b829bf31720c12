//! Request dispatch
//!
//! Every request runs the same pipeline: CORS gate, path classification,
//! bearer validation, scope policy, then the proxy hop. A step that fails
//! ends the request; nothing is skipped or reordered.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes, HttpBody as _},
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use super::cors::{self, CorsGate, OriginCheck};
use super::modifier::ModifierChain;
use super::proxy::{ProxyTarget, Upstream};
use super::rejection::Rejection;
use super::route::{AuthEndpoint, Route, RouteTable};
use crate::Result;
use crate::auth::{KeyStore, ProtocolEra, TokenValidator};
use crate::config::Config;
use crate::oauth::{
    ClientRegistrationRequest, ManagedRegistrar, Provider, RegistrationError, public_base_url,
};
use crate::policy::{ScopePolicy, parse_envelopes};

/// Protocol revision header sent by MCP clients
pub const MCP_PROTOCOL_VERSION: &str = "mcp-protocol-version";

type Outcome = std::result::Result<Response, Rejection>;

/// Shared, read-only request pipeline
pub struct AppState {
    /// Origin allow-list
    pub cors: CorsGate,
    /// Path classifier
    pub routes: RouteTable,
    /// Bearer token validator
    pub validator: TokenValidator,
    /// Method scope requirements
    pub policy: ScopePolicy,
    /// Auth-plane request rewrites
    pub modifiers: ModifierChain,
    /// MCP backend hop
    pub backend: Upstream,
    /// Authorization server hop, if one is configured
    pub auth_server: Option<Upstream>,
    /// Locally served discovery documents and registration
    pub provider: Provider,
    /// Challenge target for 401 responses
    pub resource_metadata_url: String,
    /// Largest body buffered for inspection or rewriting
    pub max_body_size: usize,
}

impl AppState {
    /// Build the pipeline from validated configuration
    ///
    /// # Errors
    ///
    /// Returns an error if an upstream URL is unusable or the HTTP client
    /// cannot be built.
    pub fn new(config: &Config, keys: Arc<KeyStore>, shutdown: CancellationToken) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.server.request_timeout)
            .build()?;
        let resource_metadata_url = config.resource_metadata_url();
        let upstream = |target: ProxyTarget| {
            Upstream::new(
                target,
                http.clone(),
                config.server.request_timeout,
                resource_metadata_url.clone(),
                shutdown.clone(),
            )
        };

        let backend = upstream(ProxyTarget::parse(
            "backend.base_url",
            &config.backend.base_url,
        )?);
        let auth_server = if config.auth_server.base_url.is_empty() {
            None
        } else {
            Some(upstream(ProxyTarget::parse(
                "auth_server.base_url",
                &config.auth_server.base_url,
            )?))
        };

        let validator = TokenValidator::new(
            keys,
            config.resource.audience.clone(),
            config.resource.protocol_cutover,
        )
        .with_downgrade_without_version(config.resource.downgrade_without_version);

        Ok(Self {
            cors: CorsGate::from_config(&config.cors),
            routes: RouteTable::from_config(config),
            validator,
            policy: ScopePolicy::from_config(&config.required_scopes),
            modifiers: ModifierChain::from_config(&config.auth_server),
            backend,
            auth_server,
            provider: Provider::from_config(config, http.clone()),
            resource_metadata_url,
            max_body_size: config.server.max_body_size,
        })
    }
}

/// Create the router; every path goes through [`dispatch`]
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if *request.method() == Method::OPTIONS {
        return state.cors.preflight(request.headers());
    }

    let origin = state.cors.check(request.headers());
    if origin == OriginCheck::Denied {
        debug!(origin = ?request.headers().get(header::ORIGIN), "Origin not allowed");
        return cors::forbidden();
    }
    let request_headers = request.headers().clone();

    let route = state.routes.classify(request.method(), request.uri().path());
    let outcome = match route {
        Route::Auth(endpoint) => handle_auth(&state, endpoint, request).await,
        Route::Mcp {
            streaming,
            backend_path,
        } => handle_mcp(&state, streaming, &backend_path, request).await,
        Route::Rejected => {
            debug!(path = %request.uri().path(), "Path not served");
            Err(Rejection::Forbidden("Forbidden".to_string()))
        }
    };

    let mut response = outcome.unwrap_or_else(IntoResponse::into_response);
    if let OriginCheck::Allowed(origin) = origin {
        state
            .cors
            .apply(response.headers_mut(), &origin, &request_headers);
    }
    response
}

async fn handle_auth(state: &AppState, endpoint: AuthEndpoint, request: Request) -> Outcome {
    match endpoint {
        AuthEndpoint::ProtectedResourceMetadata => {
            let base = public_base_url(request.headers());
            return Ok(Json(state.provider.protected_resource_metadata(&base)).into_response());
        }
        AuthEndpoint::AuthorizationServerMetadata => {
            let base = public_base_url(request.headers());
            if let Some(metadata) = state.provider.authorization_metadata(&base) {
                return Ok(Json(metadata).into_response());
            }
        }
        AuthEndpoint::Register => {
            if let Some(registrar) = state.provider.registrar() {
                return register(registrar, request, state.max_body_size).await;
            }
        }
        AuthEndpoint::Authorize | AuthEndpoint::Token | AuthEndpoint::UserFlow => {}
    }

    let Some(upstream) = &state.auth_server else {
        warn!(path = %request.uri().path(), "No authorization server configured");
        return Err(Rejection::BadGateway);
    };

    let path = request.uri().path().to_string();
    if !state.modifiers.has(&path) {
        let (parts, body) = request.into_parts();
        let body = passthrough_body(body);
        return upstream.forward(&parts, &path, body, false).await;
    }

    let (parts, body) = request.into_parts();
    let bytes = buffer(body, state.max_body_size).await?;
    let modified = state
        .modifiers
        .apply(&path, axum::http::Request::from_parts(parts, bytes))
        .map_err(|e| {
            debug!(path = %path, error = %e, "Auth request could not be amended");
            Rejection::BadRequest(e.to_string())
        })?;
    let (parts, bytes) = modified.into_parts();
    upstream.forward(&parts, &path, bytes.into(), false).await
}

async fn register(registrar: &ManagedRegistrar, request: Request, limit: usize) -> Outcome {
    let bytes = buffer(request.into_body(), limit).await?;
    let registration: ClientRegistrationRequest = serde_json::from_slice(&bytes)
        .map_err(|e| Rejection::BadRequest(format!("invalid registration request: {e}")))?;

    match registrar.register(registration).await {
        Ok(client) => Ok((StatusCode::CREATED, Json(client)).into_response()),
        Err(RegistrationError::InvalidRequest(reason)) => Err(Rejection::BadRequest(reason)),
        Err(e) => {
            warn!(error = %e, "Client registration failed");
            Err(Rejection::BadGateway)
        }
    }
}

async fn handle_mcp(state: &AppState, streaming: bool, backend_path: &str, request: Request) -> Outcome {
    let era = state.validator.era(header_str(request.headers(), MCP_PROTOCOL_VERSION));
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .map(|v| v.to_str().unwrap_or_default());

    let claims = state.validator.validate(authorization, era).map_err(|e| {
        info!(path = %backend_path, era = ?era, error = %e, "Bearer token rejected");
        Rejection::Unauthorized {
            challenge: (era == ProtocolEra::Current).then(|| state.resource_metadata_url.clone()),
            reason: "Unauthorized".to_string(),
        }
    })?;

    let (parts, body) = request.into_parts();
    if era == ProtocolEra::Legacy || streaming {
        let body = passthrough_body(body);
        return state.backend.forward(&parts, backend_path, body, streaming).await;
    }

    let bytes = buffer(body, state.max_body_size).await?;
    let calls = parse_envelopes(&bytes).map_err(|e| {
        debug!(path = %backend_path, error = %e, "Malformed JSON-RPC body");
        Rejection::BadRequest(e.to_string())
    })?;
    if !state.policy.is_empty() {
        let decision = state.policy.authorize(&calls, &claims.scopes);
        if !decision.allowed {
            info!(
                path = %backend_path,
                subject = claims.subject.as_deref().unwrap_or("-"),
                reason = %decision.reason,
                "Request denied by scope policy"
            );
            return Err(Rejection::Forbidden(decision.reason));
        }
        debug!(calls = calls.len(), reason = %decision.reason, "Scope policy passed");
    }

    state
        .backend
        .forward(&parts, backend_path, bytes.into(), false)
        .await
}

/// Stream the inbound body through; bodiless requests stay bodiless
fn passthrough_body(body: Body) -> reqwest::Body {
    if body.size_hint().exact() == Some(0) {
        reqwest::Body::from(Bytes::new())
    } else {
        reqwest::Body::wrap_stream(body.into_data_stream())
    }
}

async fn buffer(body: Body, limit: usize) -> std::result::Result<Bytes, Rejection> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        debug!(error = %e, limit, "Request body rejected");
        Rejection::PayloadTooLarge
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
