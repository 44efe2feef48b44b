// Core modules
pub mod api;
pub mod backtest;
pub mod config;
pub mod engine;
pub mod execution;
pub mod indicators;
pub mod market;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::AppConfig;
pub use execution::{OrderGateway, PositionLifecycle};
pub use models::*;
pub use strategy::SignalEngine;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Install the tracing subscriber used by the binaries
///
/// `RUST_LOG` wins over `default_filter`.
pub fn setup_logging(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .ok();
}
