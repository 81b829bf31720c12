//! OAuth 2.0 surface the proxy presents to MCP clients
//!
//! - Authorization server metadata (RFC 8414), served from a template or
//!   synthesized for managed providers
//! - Protected resource metadata (RFC 9728)
//! - Dynamic client registration against a managed tenant

mod metadata;
mod provider;
mod registration;

pub use metadata::{AuthorizationServerMetadata, ProtectedResourceMetadata, public_base_url};
pub use provider::Provider;
pub use registration::{
    ClientRegistrationRequest, ClientRegistrationResponse, ManagedRegistrar, RegistrationError,
};
