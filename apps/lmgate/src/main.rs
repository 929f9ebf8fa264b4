use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use lmgate_common::{init_tracing, Cli, GatewayConfig};

mod bootstrap;
mod http;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli)?;
    init_tracing(&config.logging.level);

    let bind = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(bootstrap::bootstrap(config).await?);
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
