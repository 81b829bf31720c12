//! Bearer token authentication: JWKS key store and JWT validation

pub mod jwks;
pub mod validator;

pub use jwks::{KeySet, KeyStore};
pub use validator::{AuthError, ProtocolEra, TokenClaims, TokenValidator};
