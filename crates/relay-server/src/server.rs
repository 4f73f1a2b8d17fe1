//! HTTP server lifecycle: bind, serve, drain.

use axum::Router;
use relay_config::ServerConfig;
use std::future::IntoFuture;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::routes::create_router;
use crate::shutdown::ShutdownCoordinator;
use crate::state::AppState;

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Accept loop failed
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// The relay HTTP server
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    state: AppState,
    shutdown: ShutdownCoordinator,
}

impl Server {
    /// Create a server for `state`
    #[must_use]
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
        Self {
            config,
            state,
            shutdown,
        }
    }

    /// Handle used to stop the server
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// Router with every route and middleware installed
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(self.state.clone(), self.config.body_limit)
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Bind, serve until shutdown is triggered, then drain
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!(addr = ?local, "Relay listening");

        let stop = self.shutdown.clone();
        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { stop.triggered().await })
            .into_future();

        let drain = self.shutdown.clone();
        let deadline = async move {
            drain.triggered().await;
            tokio::time::sleep(drain.grace()).await;
        };

        tokio::select! {
            result = server => result.map_err(ServerError::Serve)?,
            () = deadline => warn!(
                grace_secs = self.shutdown.grace().as_secs(),
                "Drain deadline passed, dropping remaining connections"
            ),
        }

        self.shutdown.complete();
        info!("Relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::state;
    use std::time::Duration;

    #[tokio::test]
    async fn test_serve_stops_on_trigger() {
        let (state, _) = state(Vec::new(), crate::testing::token(false)).await;
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            shutdown_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        };
        let server = Server::new(config, state);
        let handle = server.shutdown_handle();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(server.serve(listener));

        let stream = tokio::net::TcpStream::connect(addr).await;
        assert!(stream.is_ok());
        drop(stream);

        handle.trigger("test");
        tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handle.phase(), crate::shutdown::ShutdownPhase::Complete);
    }
}
