use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::api::{self, AppState};
use super::engine::Engine;

/// Configuration for the HTTP surface.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            dev_mode: false,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Start serving until Ctrl+C.
pub async fn start_server(config: ServerConfig, engine: Engine) -> Result<()> {
    engine
        .ensure_defaults()
        .await
        .context("Failed to create default automation documents")?;

    let mut app = build_router(Arc::new(AppState { engine }));

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { config.host.as_str() };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, dev = config.dev_mode, "billing automation listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
}
