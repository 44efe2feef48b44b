use super::{PositionStore, StoreError};
use crate::models::{Position, Trade};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process store, used by paper trading and backtests
#[derive(Default)]
pub struct MemoryPositionStore {
    positions: RwLock<HashMap<String, Position>>,
    trades: RwLock<HashMap<String, Vec<Trade>>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load_position(&self, instrument: &str) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.read().await.get(instrument).cloned())
    }

    async fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        self.positions
            .write()
            .await
            .insert(position.instrument.clone(), position.clone());
        Ok(())
    }

    async fn clear_position(&self, instrument: &str) -> Result<(), StoreError> {
        self.positions.write().await.remove(instrument);
        Ok(())
    }

    async fn record_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.trades
            .write()
            .await
            .entry(trade.instrument().to_string())
            .or_default()
            .push(trade.clone());
        Ok(())
    }

    async fn recent_trades(&self, instrument: &str, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let trades = self.trades.read().await;
        let all = trades.get(instrument).map(Vec::as_slice).unwrap_or(&[]);
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }
}
