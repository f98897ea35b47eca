//! HTTP adapter over the command arbiter.
//!
//! Dispatch-facing endpoints:
//! - `GET /api/status`, `POST /api/activate`, `POST /api/deactivate`
//!
//! Operator endpoints:
//! - `GET /api/fleet`, `POST /api/override`, `GET /api/preview`,
//!   `POST /api/apply`, `GET /api/history`, `GET|PATCH /api/config`,
//!   `POST /api/devices/{address}/control`

mod handlers;
pub mod types;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::watch;
use tracing::info;

use crate::fleet::CommandArbiter;

/// Application state shared across all request handlers.
pub struct AppState {
    pub arbiter: Arc<CommandArbiter>,
}

/// Builds the axum router with all API routes.
///
/// # Arguments
///
/// * `state` - Shared application state
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/activate", post(handlers::activate))
        .route("/api/deactivate", post(handlers::deactivate))
        .route("/api/fleet", get(handlers::get_fleet))
        .route("/api/override", post(handlers::set_override))
        .route("/api/preview", get(handlers::preview))
        .route("/api/apply", post(handlers::apply))
        .route("/api/history", get(handlers::history))
        .route(
            "/api/config",
            get(handlers::get_config).patch(handlers::patch_config),
        )
        .route(
            "/api/devices/{address}/control",
            post(handlers::control_device),
        )
        .with_state(state)
}

/// Binds to `addr` and serves the API until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns an `io::Error` if the listener cannot bind or the server fails.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
