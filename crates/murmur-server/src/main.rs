//! # murmur
//!
//! Realtime chat delivery and call-signaling server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (./murmur.toml if present)
//! murmur
//!
//! # Run with an explicit config file
//! MURMUR_CONFIG=/path/to/murmur.toml murmur
//!
//! # Override single settings from the environment
//! MURMUR_PORT=8080 MURMUR_STORAGE__PATH=/var/lib/murmur/murmur.db murmur
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting murmur server on {}:{}", config.host, config.port);
    if let Ok(effective) = toml::to_string(&config) {
        tracing::debug!("Effective configuration:\n{}", effective);
    }

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
