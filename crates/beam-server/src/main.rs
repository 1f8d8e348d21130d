//! # Beam Server
//!
//! Coordination server for live broadcast sessions.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beam
//!
//! # Run with custom config
//! beam  # reads beam.toml from the working directory if present
//!
//! # Run with environment variables
//! BEAM_PORT=8080 BEAM_HOST=0.0.0.0 beam
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beam_server=debug,beam_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Beam server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
