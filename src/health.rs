//! Health and readiness endpoints
//!
//! - `GET /healthz` - process is up
//! - `GET /readyz` - this replica is the active signer (always ready when
//!   leader election is off)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::{error, info};

#[derive(Clone)]
struct HealthState {
    leader: Option<Arc<AtomicBool>>,
}

/// Build the health router
///
/// `leader` is the elector's leadership flag, or `None` when leader
/// election is disabled.
pub fn routes(leader: Option<Arc<AtomicBool>>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(HealthState { leader })
}

async fn readyz(State(state): State<HealthState>) -> StatusCode {
    match &state.leader {
        Some(flag) if !flag.load(Ordering::SeqCst) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

/// Serve the health router on `addr` until the process exits
pub async fn start_health_server(addr: SocketAddr, leader: Option<Arc<AtomicBool>>) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => {
            info!(addr = %addr, "Health server started");
            l
        }
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind health server");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, routes(leader)).await {
        error!(error = %e, "Health server error");
    }
}
