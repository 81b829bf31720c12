//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::auth::KeyStore;
use crate::config::Config;
use crate::supervisor::{LaunchSpec, Supervisor};
use crate::{Error, Result};

/// Upper bound on stopping the supervised backend
const SUPERVISOR_SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// MCP auth proxy server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Signing keys shared with the validator
    keys: Arc<KeyStore>,
    /// Backend process and how to launch it
    backend_process: Option<(Supervisor, LaunchSpec)>,
    /// Cancels refresh tasks and open streams
    shutdown: CancellationToken,
}

impl Gateway {
    /// Create a gateway: load signing keys and resolve the launch command.
    ///
    /// # Errors
    ///
    /// Fails if the key set cannot be fetched or the configuration is
    /// unusable; both abort startup.
    pub async fn new(config: Config) -> Result<Self> {
        if config.auth_server.jwks_url.is_empty() {
            return Err(Error::Config(
                "auth_server.jwks_url is required to verify bearer tokens".to_string(),
            ));
        }

        let keys = Arc::new(KeyStore::new(config.auth_server.jwks_url.clone())?);
        keys.refresh().await?;

        let backend_process = if config.command.enabled {
            Some((Supervisor::new(), LaunchSpec::from_config(&config)?))
        } else {
            None
        };

        Ok(Self {
            config,
            keys,
            backend_process,
            shutdown: CancellationToken::new(),
        })
    }

    /// Run until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Arc::new(AppState::new(
            &self.config,
            Arc::clone(&self.keys),
            self.shutdown.clone(),
        )?);
        let app = create_router(state);

        let refresh = self.config.auth_server.jwks_refresh_interval;
        if !refresh.is_zero() {
            self.keys.spawn_refresh(refresh, self.shutdown.clone());
        }

        let listener = TcpListener::bind(addr).await?;
        self.log_banner();

        if let Err(e) = self.start_backend().await {
            warn!(error = %e, "Backend process failed to start; serving anyway");
        }

        let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = signal_rx.await;
                })
                .await
        });

        tokio::select! {
            () = shutdown_signal() => {}
            result = &mut server => {
                return match result {
                    Ok(served) => served.map_err(|e| Error::Transport(e.to_string())),
                    Err(e) => Err(Error::Internal(e.to_string())),
                };
            }
        }

        if let Some((supervisor, _)) = &self.backend_process {
            if tokio::time::timeout(SUPERVISOR_SHUTDOWN_TIMEOUT, supervisor.shutdown())
                .await
                .is_err()
            {
                warn!("Backend process shutdown timed out");
            }
        }

        self.shutdown.cancel();
        let _ = signal_tx.send(());

        match tokio::time::timeout(self.config.server.shutdown_timeout, server).await {
            Ok(Ok(served)) => served.map_err(|e| Error::Transport(e.to_string()))?,
            Ok(Err(e)) => return Err(Error::Internal(e.to_string())),
            Err(_) => warn!("Open connections did not drain before shutdown timeout"),
        }

        info!("Shutdown complete");
        Ok(())
    }

    async fn start_backend(&self) -> Result<()> {
        if let Some((supervisor, spec)) = &self.backend_process {
            supervisor.start(spec).await?;
        }
        Ok(())
    }

    fn log_banner(&self) {
        let config = &self.config;
        info!("============================================================");
        info!("MCP AUTH PROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %config.server.host, port = config.server.port, "Listening");
        info!(backend = %config.backend.base_url, "MCP backend");
        if config.auth_server.base_url.is_empty() {
            warn!("No authorization server configured; auth-plane proxying disabled");
        } else {
            info!(
                auth_server = %config.auth_server.base_url,
                mode = ?config.auth_server.mode,
                "Authorization server"
            );
        }
        info!(
            resource = %config.resource.identifier,
            cutover = %config.resource.protocol_cutover,
            keys = self.keys.snapshot().len(),
            "Token validation"
        );
        info!("  GET  {}  (SSE stream)", config.backend.paths.sse);
        info!("  POST {}  (messages)", config.backend.paths.messages);
        if let Some(path) = &config.backend.paths.streamable_http {
            info!("  ANY  {path}  (streamable HTTP)");
        }
        info!("============================================================");
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
