#![forbid(unsafe_code)]

use anyhow::Result;
use conclave::config::ServerConfig;
use conclave::media::inmemory::CodecCapability;
use conclave::media::{InMemoryEngine, PeerResourceRegistry};
use conclave::metrics::ServerMetrics;
use conclave::room::names::{InMemoryNameReservation, NameReservation, RedisNameReservation};
use conclave::room::RoomRegistry;
use conclave::signaling::{ConnectionHub, SignalingGateway, SignalingServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conclave=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Conclave - Starting server");

    let config = ServerConfig::from_env();

    let engine = Arc::new(InMemoryEngine::new(CodecCapability::defaults(), config.announced_ip)?);
    info!("Media engine initialized, announcing {}", config.announced_ip);

    let names: Arc<dyn NameReservation> = match &config.redis_url {
        Some(url) => {
            let store = RedisNameReservation::connect(url).await?;
            info!("Room names reserved in Redis as instance {}", config.instance_id);
            Arc::new(store)
        }
        None => {
            info!("REDIS_URL not set, room names are reserved in-process");
            Arc::new(InMemoryNameReservation::new())
        }
    };

    let metrics = ServerMetrics::new();
    let hub = Arc::new(ConnectionHub::new(metrics.clone()));
    let rooms = Arc::new(RoomRegistry::new(
        names,
        config.instance_id.clone(),
        config.grace_period,
        hub.clone(),
        metrics.clone(),
    ));
    let resources = Arc::new(PeerResourceRegistry::new(engine));
    let gateway = SignalingGateway::new(rooms, resources, hub, metrics);

    let server = SignalingServer::new(gateway, &config);
    server
        .serve(config.port, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
            }
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
