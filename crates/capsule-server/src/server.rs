//! HTTP server implementation.
//!
//! This module provides the main [`CapsuleServer`] struct for serving jobs
//! over HTTP.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use capsule_common::{AdminConfig, RuntimeError, ServerConfigFile};

use crate::router::{AdminRouterConfig, build_router_with_admin};
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
    /// Admin API, mounted when set.
    pub admin: Option<AdminRouterConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
            admin: None,
        }
    }
}

impl ServerConfig {
    /// Build from the `[server]` and `[admin]` sections of a config file.
    ///
    /// The Admin API is only mounted when it is enabled and has a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address cannot be parsed.
    pub fn from_file(server: &ServerConfigFile, admin: &AdminConfig) -> Result<Self, RuntimeError> {
        let bind_addr = server.bind_addr.parse().map_err(|e| {
            RuntimeError::invalid_config(format!("Invalid bind address '{}': {e}", server.bind_addr))
        })?;

        let admin = match (&admin.token, admin.is_configured()) {
            (Some(token), true) => Some(AdminRouterConfig {
                prefix: admin.prefix.clone(),
                token: token.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            bind_addr,
            request_timeout_secs: server.request_timeout_secs,
            graceful_shutdown: server.graceful_shutdown,
            admin,
        })
    }

    /// Create a new server config with custom bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Mount the Admin API under `prefix`, guarded by `token`.
    #[must_use]
    pub fn with_admin(mut self, prefix: impl Into<String>, token: impl Into<String>) -> Self {
        self.admin = Some(AdminRouterConfig {
            prefix: prefix.into(),
            token: token.into(),
        });
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The capsule HTTP server.
///
/// # Example
///
/// ```ignore
/// use capsule_common::RuntimeConfig;
/// use capsule_server::{AppState, CapsuleServer, ServerConfig};
///
/// let state = AppState::from_config(&RuntimeConfig::default())?;
/// state.executor().register_from_file("hello", "hello.wasm", Default::default())?;
///
/// CapsuleServer::new(state, ServerConfig::default()).run().await?;
/// ```
pub struct CapsuleServer {
    state: AppState,
    config: ServerConfig,
}

impl CapsuleServer {
    /// Create a server around `state`.
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// This will block until the server is shut down via signal
    /// (SIGTERM/SIGINT) if graceful shutdown is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let app = build_router_with_admin(
            self.state,
            self.config.request_timeout(),
            self.config.admin.clone(),
        );

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        info!(
            addr = %self.config.bind_addr,
            admin = self.config.admin.is_some(),
            "Starting HTTP server"
        );

        if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|e| RuntimeError::invalid_config(format!("Server error: {e}")))?;
        } else {
            axum::serve(listener, app)
                .await
                .map_err(|e| RuntimeError::invalid_config(format!("Server error: {e}")))?;
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Serve `state` on an ephemeral port (127.0.0.1:0) and return a handle
    /// for tests.
    pub async fn start_test(state: AppState, config: ServerConfig) -> Result<TestHandle, RuntimeError> {
        let app = build_router_with_admin(state.clone(), config.request_timeout(), config.admin);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to bind: {e}")))?;

        let addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to get addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
///
/// Use this to interact with and shut down a test server.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state (for loading modules).
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
///
/// A signal source that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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
