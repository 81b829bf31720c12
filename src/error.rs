//! Error types for the MCP auth proxy

use std::io;

use thiserror::Error;

use crate::supervisor::SupervisorError;

/// Result type alias for the MCP auth proxy
pub type Result<T> = std::result::Result<T, Error>;

/// MCP auth proxy errors
///
/// These are process-level failures (startup, upstream I/O, subprocess
/// management). Per-request rejections live in [`crate::gateway::Rejection`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing key set could not be fetched or decoded
    #[error("JWKS error: {0}")]
    Jwks(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Subprocess management error
    #[error("Subprocess error: {0}")]
    Subprocess(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SupervisorError> for Error {
    fn from(err: SupervisorError) -> Self {
        Self::Subprocess(err.to_string())
    }
}

impl Error {
    /// Whether this error must abort process bring-up
    #[must_use]
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Jwks(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_jwks_errors_are_fatal_at_startup() {
        assert!(Error::Config("bad url".into()).is_fatal_at_startup());
        assert!(Error::Jwks("connection refused".into()).is_fatal_at_startup());
        assert!(!Error::Subprocess("exited".into()).is_fatal_at_startup());
    }

    #[test]
    fn supervisor_errors_become_subprocess_errors() {
        let err: Error = SupervisorError::AlreadyRunning(42).into();
        assert!(matches!(err, Error::Subprocess(ref msg) if msg.contains("42")));
        assert!(!err.is_fatal_at_startup());
    }

    #[test]
    fn io_error_converts_with_question_mark() {
        fn fails() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
