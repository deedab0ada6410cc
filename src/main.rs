//! TCP Chat Relay - Entry Point
//!
//! Loads configuration, binds the listener and serves until Ctrl-C or SIGTERM.

use std::env;
use std::net::SocketAddr;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_relay::{RelayConfig, RelayServer};

/// Environment variable naming an optional JSON config file
const CONFIG_ENV: &str = "CHAT_RELAY_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let mut config = match env::var(CONFIG_ENV) {
        Ok(path) => {
            info!("Loading config from {}", path);
            RelayConfig::from_file(&path)?
        }
        Err(_) => RelayConfig::default(),
    };

    // Bind address from command line overrides the config
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr.parse::<SocketAddr>()?;
    }

    let server = RelayServer::bind(config).await?;
    info!("Chat relay listening on {}", server.local_addr()?);

    let stopped = server.serve(shutdown_signal()).await;
    info!("{}", stopped);

    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
