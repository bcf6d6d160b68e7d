use anyhow::Result;
use fanout_server::{PipelineRegistry, RelayConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout_server=debug,webrtc=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fanout relay...");

    let config = Arc::new(RelayConfig::load()?);
    tracing::info!(
        stun_servers = ?config.stun_servers,
        retransmit_cache_size = config.retransmit_cache_size,
        "Loaded configuration"
    );

    let registry = PipelineRegistry::new(config);
    let shutdown = CancellationToken::new();
    let sweep = tokio::spawn(Arc::clone(&registry).run_stats_sweep(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    shutdown.cancel();
    sweep.await?;
    registry.shutdown().await;

    Ok(())
}
