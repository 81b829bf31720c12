//! MCP Auth Proxy Library
//!
//! Authorizing reverse proxy that sits in front of an MCP server and turns
//! it into an OAuth 2.0 protected resource.
//!
//! # Features
//!
//! - **Token validation**: RSA-signed JWTs verified against a JWKS, with
//!   audience checks for clients on current protocol revisions
//! - **Scope policy**: per-method (and per-tool) required scopes, ANY-of
//! - **Auth plane**: `/authorize`, `/token` and `/register` proxied to the
//!   authorization server with parameter injection; discovery documents
//!   served locally
//! - **SSE**: endpoint events rewritten so clients call back through the proxy
//! - **Supervision**: optional stdio MCP server launched behind an SSE bridge
//!
//! # Protocol Version
//!
//! Clients announcing `MCP-Protocol-Version` on or after the configured
//! cutover get full enforcement; older clients get signature checks only.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod policy;
pub mod supervisor;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("tracing init failed: {e}")))
}
