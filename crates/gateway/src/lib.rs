//! HTTP API gateway for Switchboard.
//!
//! Exposes a health check and the v1 API (queries, sessions, tools and
//! tool-server status). Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use switchboard_config::AppConfig;
use switchboard_orchestrator::Runtime;
use switchboard_servers::HttpConnector;

pub use api_v1::{ApiState, SharedApiState};

/// Build the full router: `/health` plus the v1 API nested under `/v1`.
///
/// Layers applied:
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Assemble a runtime with the configured inference provider and the HTTP
/// tool-server transport.
pub fn runtime_from_config(config: AppConfig) -> Result<Runtime, Box<dyn std::error::Error>> {
    let inference = switchboard_providers::router::build_from_config(&config.inference)?;
    let connector = Arc::new(HttpConnector::new(config.tool_servers.connect_timeout())?);
    Ok(Runtime::build(config, inference, connector))
}

/// Start the gateway HTTP server.
///
/// Runs until Ctrl-C, then stops the sweeper and disconnects tool servers.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let mut runtime = runtime_from_config(config)?;
    runtime.start_background();
    // Outage is logged inside; tool-free queries still work.
    let _ = runtime.connect_tool_servers().await;

    let app = build_router(Arc::new(ApiState::from_runtime(&runtime)));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(runtime.shutdown_token()))
        .await?;

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
        _ = token.cancelled() => {}
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
