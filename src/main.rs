mod bridge;
mod catalog;
mod config;
mod erd;
mod erd_client;
mod error;
mod mqtt;
mod persistence;
mod polling;
mod runtime;
mod store;
mod timer;

use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,erd_bridge=debug")),
        )
        .init();

    tracing::info!("Starting erd-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::from_env()?;
    tracing::info!(
        "Device {}, bus address 0x{:02X}, cache at {}",
        config.device_id,
        config.client_address,
        config.storage.path.display()
    );

    runtime::run(config).await
}
