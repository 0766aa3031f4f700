use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use hearth_engine::QueryService;

use crate::handlers;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            request_timeout_secs: 30,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/devices",
            post(handlers::register_device).get(handlers::list_devices),
        )
        .route(
            "/devices/{id}",
            get(handlers::get_device).delete(handlers::delete_device),
        )
        .route("/devices/{id}/state", get(handlers::get_state))
        .route(
            "/devices/{id}/events",
            post(handlers::record_event).get(handlers::get_history),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the serve task
/// alive.
pub async fn start(
    config: ServerConfig,
    service: Arc<QueryService>,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState { service }).layer(TimeoutLayer::new(
        Duration::from_secs(config.request_timeout_secs),
    ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}
