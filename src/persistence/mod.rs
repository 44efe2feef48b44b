// Position and trade journal storage
pub mod memory;
pub mod redis_store;

pub use memory::MemoryPositionStore;
pub use redis_store::RedisPositionStore;

use crate::models::{Position, Trade};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to (de)serialize stored record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("redis connection timeout after {0} seconds")]
    ConnectTimeout(u64),
}

/// Durable record of the open position per instrument plus a trade journal
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn load_position(&self, instrument: &str) -> Result<Option<Position>, StoreError>;

    async fn save_position(&self, position: &Position) -> Result<(), StoreError>;

    async fn clear_position(&self, instrument: &str) -> Result<(), StoreError>;

    async fn record_trade(&self, trade: &Trade) -> Result<(), StoreError>;

    /// Most recent trades, oldest first
    async fn recent_trades(&self, instrument: &str, limit: usize) -> Result<Vec<Trade>, StoreError>;
}
