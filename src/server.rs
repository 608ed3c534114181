use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json},
    routing::{get, IntoMakeService},
    Router,
};
use hyper::server::conn::AddrIncoming;
use hyper::Server;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::metrics::MetricsRegistry;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Prometheus scrape endpoint
async fn metrics(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        registry.render(),
    )
}

pub fn create_router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(registry)
}

/// The HTTP listener serving `/metrics`, bound but not yet serving.
pub struct MetricsServer {
    server: Server<AddrIncoming, IntoMakeService<Router>>,
}

impl MetricsServer {
    /// Binds the listening socket. Failing to bind is a startup error.
    pub fn bind(addr: SocketAddr, registry: Arc<MetricsRegistry>) -> Result<Self> {
        let server = Server::try_bind(&addr)?.serve(create_router(registry).into_make_service());
        Ok(Self { server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Serves until `shutdown` is cancelled, then finishes in-flight scrapes.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(address = %self.local_addr(), "running HTTP server");
        self.server
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        info!("HTTP server stopped");
        Ok(())
    }
}
