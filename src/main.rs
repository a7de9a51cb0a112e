use std::sync::Arc;

use anyhow::anyhow;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use outpost_sync_server::config::{ServerConfig, SyncConfig};
use outpost_sync_server::game::geometry::load_obstacles;
use outpost_sync_server::metrics::{self, Metrics};
use outpost_sync_server::net::room::RoomRegistry;
use outpost_sync_server::net::transport::WebTransportServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Outpost Sync Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate().map_err(|e| anyhow!("Invalid server configuration: {}", e))?;
    let sync = SyncConfig::load_or_default();
    sync.validate().map_err(|e| anyhow!("Invalid sync configuration: {}", e))?;
    info!(
        "Configuration loaded: {}:{}, max_rooms={}, tick={}Hz, broadcast={}Hz, input={}Hz",
        config.bind_address,
        config.port,
        config.max_rooms,
        sync.tick_rate,
        sync.broadcast_rate,
        sync.input_rate
    );

    let metrics = Arc::new(Metrics::new());
    let metrics_port = config.metrics_port;
    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let geometry = match config.geometry_path.as_deref() {
        Some(path) => {
            let obstacles = load_obstacles(path)?;
            info!("Loaded {} obstacles from {}", obstacles.len(), path);
            obstacles
        }
        None => Vec::new(),
    };

    let registry = Arc::new(
        RoomRegistry::new(sync, config.max_rooms, config.max_players_per_room, metrics)
            .with_geometry(geometry),
    );

    let server = WebTransportServer::new(config.clone(), registry).await?;
    info!("Server ready on https://{}", server.bind_addr());
    info!("Certificate hash: {}", server.cert_hash());

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
                return Err(e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    info!("Server stopped");
    Ok(())
}
