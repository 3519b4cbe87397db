//! HTTP server command: `billing-automation serve`.

use anyhow::{Context, Result};

use billing_automation::automation::Engine;
use billing_automation::automation::server::{ServerConfig, start_server};
use billing_automation::config::AutomationToml;

pub async fn cmd_serve(mut config: AutomationToml, port: Option<u16>, dev: bool) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let engine = Engine::from_config(&config)
        .await
        .context("Failed to open automation engine")?;

    start_server(
        ServerConfig {
            host: config.server.host.clone(),
            port: config.server.port,
            dev_mode: dev,
        },
        engine,
    )
    .await
}
