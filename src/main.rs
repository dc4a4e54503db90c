use liveroom::config::ServerConfig;
use liveroom::server::{self, SignalingService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("liveroom=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    info!("Starting signaling service on {}", config.bind);
    let listener = TcpListener::bind(config.bind).await?;

    let service = Arc::new(SignalingService::new());
    server::serve(listener, service).await?;
    Ok(())
}
