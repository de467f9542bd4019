//! Admin HTTP API.
//!
//! # Routes
//! - `GET  /admin/status`               version and configured services
//! - `GET  /admin/health`               health of every service
//! - `GET  /admin/health/{service}`     health of one service
//! - `GET  /admin/quotas/{resource}`    current window usage
//! - `POST /admin/cache/invalidate`     `{"key": ...}` or `{"prefix": ...}`
//!
//! Every route requires `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::gateway::Gateway;
use crate::lifecycle::Shutdown;

/// Shared state for admin handlers.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(gateway: Arc<Gateway>, api_key: &str) -> Self {
        Self {
            gateway,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/health", get(get_all_health))
        .route("/admin/health/{service}", get(get_service_health))
        .route("/admin/quotas/{resource}", get(get_quota))
        .route("/admin/cache/invalidate", post(invalidate_cache))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until shutdown is triggered.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    shutdown: Shutdown,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");

    let mut stop = shutdown.subscribe();
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}
