pub mod binance;
pub mod netflow_csv;

pub use binance::{BinanceFuturesClient, Credentials};
pub use netflow_csv::CsvNetflowSource;

use crate::models::{NetflowTick, PriceTick};
use crate::Result;
use async_trait::async_trait;

/// Supplies closing prices for the price producer
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Up to `limit` most recent closed prices, oldest first
    async fn recent_closes(&self, instrument: &str, limit: usize) -> Result<Vec<PriceTick>>;
}

/// Supplies 5m and 1h netflow readings
///
/// Returning the same tick twice is fine; the aggregator keeps only newer ones.
#[async_trait]
pub trait NetflowSource: Send + Sync {
    async fn latest(&self, instrument: &str) -> Result<Vec<NetflowTick>>;
}
