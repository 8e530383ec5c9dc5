use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use clustered_ws_hub::{
    backplane::Bridge,
    cli::Cli,
    config::{ConnectionSettings, HubConfig},
    hub::Hub,
    message::NodeId,
    server::{self, AppState},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let node_id = NodeId::generate();
    let bridge = if cli.no_backplane {
        info!("backplane disabled by flag");
        Bridge::disabled(node_id.clone())
    } else {
        Bridge::connect(&cli.backplane_config(), node_id.clone()).await
    };

    let hub = Hub::new(bridge, HubConfig::default());
    let state = AppState {
        hub: hub.handle(),
        settings: ConnectionSettings::default(),
    };
    let hub_task = tokio::spawn(hub.run_until(shutdown_signal()));

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!(node = %node_id, "listening on {}", listener.local_addr()?);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if let Err(err) = hub_task.await {
        warn!(error = ?err, "hub task failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
}
