//! CORS gate.
//!
//! Origins are matched exactly against the allow-list. A request without an
//! `Origin` header is answered as if it came from the first allowed origin.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::config::CorsConfig;

const EXPOSE_HEADERS: &str = "WWW-Authenticate, MCP-Protocol-Version";

/// Origin check and CORS response headers
#[derive(Debug, Clone)]
pub struct CorsGate {
    allowed_origins: Vec<String>,
    allowed_methods: String,
    allowed_headers: String,
    allow_credentials: bool,
}

/// Result of checking the request origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginCheck {
    /// Echo this value in `Access-Control-Allow-Origin`
    Allowed(String),
    /// No origin and nothing to default to: no CORS headers
    NotApplicable,
    /// Origin present but not allowed
    Denied,
}

impl CorsGate {
    /// Build from configuration
    pub fn from_config(config: &CorsConfig) -> Self {
        Self {
            allowed_origins: config.allowed_origins.clone(),
            allowed_methods: config.allowed_methods.join(", "),
            allowed_headers: config.allowed_headers.join(", "),
            allow_credentials: config.allow_credentials,
        }
    }

    /// Check the request's `Origin`
    pub fn check(&self, headers: &HeaderMap) -> OriginCheck {
        match headers.get(header::ORIGIN).map(HeaderValue::to_str) {
            Some(Ok(origin)) if self.allowed_origins.iter().any(|o| o == origin) => {
                OriginCheck::Allowed(origin.to_string())
            }
            Some(_) => OriginCheck::Denied,
            None => self
                .allowed_origins
                .first()
                .map_or(OriginCheck::NotApplicable, |o| OriginCheck::Allowed(o.clone())),
        }
    }

    /// Answer an `OPTIONS` preflight
    pub fn preflight(&self, request: &HeaderMap) -> Response {
        match self.check(request) {
            OriginCheck::Allowed(origin) => {
                let mut response = StatusCode::NO_CONTENT.into_response();
                self.apply(response.headers_mut(), &origin, request);
                response
            }
            OriginCheck::NotApplicable => StatusCode::NO_CONTENT.into_response(),
            OriginCheck::Denied => forbidden(),
        }
    }

    /// Add CORS headers for `origin` to a response
    pub fn apply(&self, headers: &mut HeaderMap, origin: &str, request: &HeaderMap) {
        let Ok(origin) = HeaderValue::from_str(origin) else {
            return;
        };
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        if let Ok(methods) = HeaderValue::from_str(&self.allowed_methods) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
        }

        let allow_headers = request
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned()
            .or_else(|| HeaderValue::from_str(&self.allowed_headers).ok());
        if let Some(value) = allow_headers {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
        }

        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSE_HEADERS),
        );
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
        if self.allow_credentials {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }
}

/// 403 for an origin outside the allow-list, without CORS headers
pub fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, Body::from("CORS origin not allowed")).into_response()
}
