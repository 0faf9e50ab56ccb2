use anyhow::{Context, Result};
use relay_gate::{
    HostInitializer, InitializerHolder, Router, Server, config::DEFAULT_CONFIG_FILE, install,
    load_config, serve,
};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
    let config = load_config(&config_path)?;
    info!(
        config_file = %config_path.display(),
        enabled = config.enabled,
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        targets = config.targets.len(),
        "Configuration loaded"
    );

    let router = Router::from_config(&config).context("Invalid routing configuration")?;
    let holder = InitializerHolder::new(Arc::new(HostInitializer::new(Arc::new(router))));

    if config.enabled {
        let anchor = config.trust_anchor().context("Invalid trust_anchor")?;
        install(&holder, Arc::new(anchor)).context("Failed to install handshake authentication")?;
        info!("Handshake authentication enabled");
    } else {
        info!("Not installing handshake authentication; disabled in configuration");
    }

    let server = Server::new(holder, config.listen.allowed_relay_ips.clone())
        .context("Invalid allowed_relay_ips")?;

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(listen_addr = %addr, "Relay gate listening");

    serve(listener, Arc::new(server)).await
}
