//! Parameter injection for auth-plane requests.
//!
//! `/authorize` gets configured query parameters; `/token` and `/register`
//! get configured body parameters merged into form or JSON bodies.
//! Configured values overwrite client-supplied ones.

use std::collections::{BTreeMap, HashMap};

use axum::http::{
    HeaderValue, Method, Request, Uri, header,
    uri::{InvalidUriParts, PathAndQuery},
};
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::form_urlencoded;

use super::route::{AUTHORIZE_PATH, REGISTER_PATH, TOKEN_PATH};
use crate::config::AuthServerConfig;

/// A request could not be amended
#[derive(Debug, Error)]
pub enum ModifyError {
    /// Form body is not valid UTF-8
    #[error("invalid form body: {0}")]
    Form(#[from] std::str::Utf8Error),
    /// JSON body does not parse
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
    /// JSON body is not an object
    #[error("JSON body must be an object")]
    NotAnObject,
    /// Rebuilt URI is invalid
    #[error("invalid request URI: {0}")]
    Uri(String),
}

impl From<InvalidUriParts> for ModifyError {
    fn from(e: InvalidUriParts) -> Self {
        Self::Uri(e.to_string())
    }
}

/// A single rewrite step over a buffered request
pub trait RequestModifier: Send + Sync {
    /// Rewrite the request or explain why it cannot be forwarded
    fn modify(&self, request: Request<Bytes>) -> Result<Request<Bytes>, ModifyError>;
}

fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merge pairs, replacing every existing occurrence of a configured key
fn merge_pairs(existing: &[u8], params: &BTreeMap<String, Value>) -> String {
    let mut out = form_urlencoded::Serializer::new(String::new());
    for (k, v) in form_urlencoded::parse(existing) {
        if !params.contains_key(k.as_ref()) {
            out.append_pair(&k, &v);
        }
    }
    for (k, v) in params {
        out.append_pair(k, &param_string(v));
    }
    out.finish()
}

/// Adds query parameters
#[derive(Debug, Clone)]
pub struct QueryParams {
    params: BTreeMap<String, Value>,
}

impl QueryParams {
    /// Create from configured pairs
    pub fn new(params: BTreeMap<String, Value>) -> Self {
        Self { params }
    }
}

impl RequestModifier for QueryParams {
    fn modify(&self, request: Request<Bytes>) -> Result<Request<Bytes>, ModifyError> {
        let (mut parts, body) = request.into_parts();
        let query = merge_pairs(parts.uri.query().unwrap_or("").as_bytes(), &self.params);
        let path_and_query = format!("{}?{query}", parts.uri.path());

        let mut uri_parts = parts.uri.into_parts();
        uri_parts.path_and_query = Some(
            PathAndQuery::try_from(path_and_query).map_err(|e| ModifyError::Uri(e.to_string()))?,
        );
        parts.uri = Uri::from_parts(uri_parts)?;
        Ok(Request::from_parts(parts, body))
    }
}

/// Adds body parameters to form-encoded or JSON bodies
#[derive(Debug, Clone)]
pub struct BodyParams {
    params: BTreeMap<String, Value>,
}

impl BodyParams {
    /// Create from configured pairs
    pub fn new(params: BTreeMap<String, Value>) -> Self {
        Self { params }
    }

    fn merge_json(&self, body: &[u8]) -> Result<Vec<u8>, ModifyError> {
        let mut value: Value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_slice(body)?
        };
        let object = value.as_object_mut().ok_or(ModifyError::NotAnObject)?;
        for (k, v) in &self.params {
            object.insert(k.clone(), v.clone());
        }
        Ok(serde_json::to_vec(&value)?)
    }
}

impl RequestModifier for BodyParams {
    fn modify(&self, request: Request<Bytes>) -> Result<Request<Bytes>, ModifyError> {
        if *request.method() != Method::POST {
            return Ok(request);
        }

        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        let (mut parts, body) = request.into_parts();
        let new_body = if content_type.contains("application/x-www-form-urlencoded") {
            std::str::from_utf8(&body)?;
            merge_pairs(&body, &self.params).into_bytes()
        } else if content_type.contains("application/json") {
            self.merge_json(&body)?
        } else {
            debug!(content_type = %content_type, "Body parameters skipped for content type");
            return Ok(Request::from_parts(parts, body));
        };

        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(new_body.len()));
        parts.headers.remove(header::TRANSFER_ENCODING);
        Ok(Request::from_parts(parts, Bytes::from(new_body)))
    }
}

/// Modifiers keyed by auth-plane path
#[derive(Default)]
pub struct ModifierChain {
    by_path: HashMap<&'static str, Vec<Box<dyn RequestModifier>>>,
}

impl ModifierChain {
    /// Build from the `auth_server.paths` section
    pub fn from_config(config: &AuthServerConfig) -> Self {
        let mut chain = Self::default();
        for path in [AUTHORIZE_PATH, TOKEN_PATH, REGISTER_PATH] {
            let Some(overrides) = config.paths.get(path) else {
                continue;
            };
            if !overrides.add_query_params.is_empty() {
                chain.push(path, QueryParams::new(overrides.add_query_params.clone()));
            }
            if !overrides.add_body_params.is_empty() {
                chain.push(path, BodyParams::new(overrides.add_body_params.clone()));
            }
        }
        chain
    }

    /// Append a modifier for `path`
    pub fn push(&mut self, path: &'static str, modifier: impl RequestModifier + 'static) {
        self.by_path.entry(path).or_default().push(Box::new(modifier));
    }

    /// Whether any modifier is registered for `path`
    pub fn has(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    /// Run every modifier registered for `path`, in order
    pub fn apply(&self, path: &str, request: Request<Bytes>) -> Result<Request<Bytes>, ModifyError> {
        let Some(modifiers) = self.by_path.get(path) else {
            return Ok(request);
        };
        modifiers
            .iter()
            .try_fold(request, |request, modifier| modifier.modify(request))
    }
}
