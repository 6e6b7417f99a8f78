use crate::api::HttpDeviceApi;
use crate::app_config::AppConfig;
use crate::fleet::Fleet;
use std::sync::Arc;
use tracing::info;

mod api;
mod app_config;
mod duplex;
mod fleet;
mod identity;
mod session;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    tracing_subscriber::fmt().with_max_level(config.log().level()).init();

    info!("🪵 Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        server = config.server().url(),
        devices = config.fleet().count(),
        "✅  Loaded configuration"
    );

    let client = api::new_client(&config)?;
    let device_api = Arc::new(HttpDeviceApi::new(client, config.server().url()));
    info!("✅  Initialized device API client");

    info!("🔥 {} is up and running", env!("CARGO_PKG_NAME"));
    Fleet::new(device_api, Arc::new(config)).run().await?;

    Ok(())
}
