//! Tap Race Server
//!
//! Serves race rooms over WebSocket until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tap_race::{GameServer, ServerConfig, MAX_PLAYERS, SPEED_CAP, TAP_IMPULSE, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Tap Race Server v{}", VERSION);

    let config = ServerConfig::from_env();
    config.validate()?;
    info!(
        "Configuration loaded: {}, max_connections={}, default_room={}, version={}",
        config.bind_addr, config.max_connections, config.default_room, config.version
    );
    info!(
        "Rules: {} players per room, tap impulse {}, speed cap {}",
        MAX_PLAYERS, TAP_IMPULSE, SPEED_CAP
    );

    let server = Arc::new(GameServer::new(config));

    // Shutdown signal handler
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = shutdown => {
            server.shutdown();
            // Give connection tasks a moment to send the shutdown notice
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    info!("Server stopped");
    Ok(())
}
