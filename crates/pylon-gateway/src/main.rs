use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use pylon_gateway::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pylon_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit PYLON_CONFIG path > ./pylon.toml > defaults
    let config = pylon_core::PylonConfig::load(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        pylon_core::PylonConfig::default()
    });

    if config.gateway.backend_auth_token.is_none() {
        tracing::warn!("no backend_auth_token configured — sender handshakes will be rejected");
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let broker = pylon_broker::Broker::new(config.broker.clone());
    let state = Arc::new(app::AppState::new(config, broker));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Pylon gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
