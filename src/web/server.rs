//! Axum HTTP server for the read API.

use axum::Router;
use sqlx::PgPool;
use tracing::info;

use super::routes;

/// Shared state for all web routes.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
}

/// HTTP server exposing funds, analytics, ranking, and sync control.
pub struct WebServer {
    addr: String,
    state: AppState,
}

impl WebServer {
    pub fn new(addr: String, db: PgPool) -> Self {
        Self {
            addr,
            state: AppState { db },
        }
    }

    /// Serve until SIGINT/SIGTERM, then drain in-flight requests.
    pub async fn start(self) -> anyhow::Result<()> {
        let app = Router::new()
            .merge(routes::api_routes())
            .with_state(self.state);

        info!(addr = %self.addr, "api listening");
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(crate::shutdown_signal())
            .await?;

        Ok(())
    }
}
