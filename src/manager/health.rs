//! Liveness and readiness probes
//!
//! Routes:
//! - `GET /healthz` - ok while the process is serving
//! - `GET /readyz` - ok once the manager has started, 503 before

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Error;

/// Shared state for probe handlers
#[derive(Clone, Debug)]
pub struct HealthState {
    ready: watch::Receiver<bool>,
}

impl HealthState {
    /// Probe state that follows the manager's started flag
    pub fn new(ready: watch::Receiver<bool>) -> Self {
        Self { ready }
    }
}

/// Create the probe router
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if *state.ready.borrow() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Bind the probe listener
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr).await.map_err(|e| {
        Error::manager_with_context("health", format!("failed to bind {}: {}", addr, e))
    })
}

/// Serve probes on `listener` until `token` is cancelled
pub async fn serve(
    listener: TcpListener,
    state: HealthState,
    token: CancellationToken,
) -> Result<(), Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "serving health probes");
    }
    axum::serve(listener, health_router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| Error::manager_with_context("health", format!("probe server failed: {}", e)))
}
