//! Bearer token validation.
//!
//! # Verification flow
//!
//! 1. Extract the bearer token from the `Authorization` header.
//! 2. Decode the JWT header (no verification) and require an RSA algorithm.
//! 3. Look up the `kid` in the current key set. An unknown `kid` is reported
//!    as such, before any signature work.
//! 4. Verify the signature and the time claims (`exp`, `nbf`) when present.
//! 5. For clients on the current protocol revision only: require an `aud`
//!    claim naming this resource.
//!
//! Legacy clients (protocol version before the cutover date) stop after step 4.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::jwks::KeyStore;
use crate::policy::split_scopes;

/// Clock skew tolerated on `exp` and `nbf`
const LEEWAY_SECS: u64 = 60;

/// Why a bearer token was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization` header
    #[error("missing Authorization header")]
    MissingHeader,
    /// Header present but not `Bearer <token>`
    #[error("Authorization header is not a bearer token")]
    NotBearer,
    /// `Bearer` with nothing after it
    #[error("empty bearer token")]
    EmptyToken,
    /// Not a parseable JWT
    #[error("malformed token: {0}")]
    Malformed(String),
    /// Signed with something other than RSA
    #[error("unsupported signing algorithm {0}")]
    UnsupportedAlgorithm(String),
    /// JWT header has no `kid`
    #[error("token header has no kid")]
    MissingKeyId,
    /// `kid` not present in the key set
    #[error("unknown kid {0}")]
    UnknownKeyId(String),
    /// Signature does not verify against the key for `kid`
    #[error("signature verification failed")]
    InvalidSignature,
    /// `exp` in the past
    #[error("token expired")]
    Expired,
    /// `nbf` in the future
    #[error("token not yet valid")]
    NotYetValid,
    /// No `aud` claim
    #[error("token has no audience")]
    MissingAudience,
    /// `aud` does not name this resource
    #[error("token audience does not include {0}")]
    AudienceMismatch(String),
}

/// Which enforcement regime a request falls under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEra {
    /// Before the cutover: signature only
    Legacy,
    /// On or after the cutover: signature, audience and scope policy
    Current,
}

/// Claims of a verified token
#[derive(Debug, Clone)]
pub struct TokenClaims {
    /// `sub`
    pub subject: Option<String>,
    /// `aud`, normalized to a list
    pub audiences: Vec<String>,
    /// Granted scopes from `scope` or `scp`
    pub scopes: BTreeSet<String>,
    /// Every claim as received
    pub raw: Map<String, Value>,
}

impl TokenClaims {
    fn from_raw(raw: Map<String, Value>) -> Self {
        let audiences = match raw.get("aud") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        };

        let scopes = ["scope", "scp"]
            .iter()
            .find_map(|name| raw.get(*name))
            .map(|value| match value {
                Value::String(s) => split_scopes(s),
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .flat_map(split_scopes)
                    .collect(),
                _ => BTreeSet::new(),
            })
            .unwrap_or_default();

        Self {
            subject: raw.get("sub").and_then(Value::as_str).map(String::from),
            audiences,
            scopes,
            raw,
        }
    }
}

/// Verifies bearer tokens against a [`KeyStore`]
pub struct TokenValidator {
    keys: Arc<KeyStore>,
    audience: String,
    cutover: NaiveDate,
    downgrade_without_version: bool,
}

impl TokenValidator {
    /// Create a validator requiring `audience` from current-era clients
    pub fn new(keys: Arc<KeyStore>, audience: impl Into<String>, cutover: NaiveDate) -> Self {
        Self {
            keys,
            audience: audience.into(),
            cutover,
            downgrade_without_version: true,
        }
    }

    /// Whether a missing or unparseable version header means legacy
    #[must_use]
    pub fn with_downgrade_without_version(mut self, downgrade: bool) -> Self {
        self.downgrade_without_version = downgrade;
        self
    }

    /// Classify a `MCP-Protocol-Version` header value
    pub fn era(&self, version: Option<&str>) -> ProtocolEra {
        let parsed = version.and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok());
        match parsed {
            Some(date) if date >= self.cutover => ProtocolEra::Current,
            Some(_) => ProtocolEra::Legacy,
            None if self.downgrade_without_version => ProtocolEra::Legacy,
            None => ProtocolEra::Current,
        }
    }

    /// Validate the `Authorization` header value for a request in `era`
    pub fn validate(
        &self,
        authorization: Option<&str>,
        era: ProtocolEra,
    ) -> Result<TokenClaims, AuthError> {
        let token = bearer_token(authorization)?;
        let claims = self.verify_signature(token)?;

        if era == ProtocolEra::Current {
            self.check_audience(&claims)?;
        }
        Ok(claims)
    }

    fn verify_signature(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| AuthError::Malformed(e.to_string()))?;

        if !matches!(header.alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) {
            return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let kid = header.kid.ok_or(AuthError::MissingKeyId)?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.clone()))?;

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.leeway = LEEWAY_SECS;

        let data = jsonwebtoken::decode::<Map<String, Value>>(token, &key, &validation).map_err(
            |e| match e.kind() {
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::ImmatureSignature => AuthError::NotYetValid,
                _ => AuthError::Malformed(e.to_string()),
            },
        )?;

        debug!(kid = %kid, "Token signature verified");
        Ok(TokenClaims::from_raw(data.claims))
    }

    fn check_audience(&self, claims: &TokenClaims) -> Result<(), AuthError> {
        if claims.audiences.is_empty() {
            return Err(AuthError::MissingAudience);
        }
        if claims.audiences.iter().any(|a| a == &self.audience) {
            Ok(())
        } else {
            Err(AuthError::AudienceMismatch(self.audience.clone()))
        }
    }
}

/// Strip the `Bearer` scheme (case-insensitive)
fn bearer_token(authorization: Option<&str>) -> Result<&str, AuthError> {
    let value = authorization.ok_or(AuthError::MissingHeader)?.trim();
    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::NotBearer);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    Ok(token)
}
