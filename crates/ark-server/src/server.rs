use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::router::build_router;
use crate::state::AppState;

/// ark object server.
pub struct ArkServer {
    config: ServerConfig,
}

impl ArkServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open storage and build the router (useful for testing).
    pub fn router(&self) -> ServerResult<axum::Router> {
        Ok(build_router(AppState::from_config(self.config.clone())?))
    }

    /// Serve requests until ctrl-c.
    pub async fn serve(self) -> ServerResult<()> {
        let app = self.router()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("ark server listening on {}", self.config.bind_addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(e) => {
            tracing::warn!(error = %e, "can't listen for ctrl-c; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_construction() {
        let server = ArkServer::new(ServerConfig::default());
        assert_eq!(server.config().bind_addr.port(), 8283);
    }

    #[test]
    fn router_builds() {
        let dir = tempfile::tempdir().unwrap();
        let server = ArkServer::new(ServerConfig {
            root: dir.path().to_path_buf(),
            ..ServerConfig::default()
        });
        let _router = server.router().unwrap();
    }
}
