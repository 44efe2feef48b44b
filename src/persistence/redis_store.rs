use super::{PositionStore, StoreError};
use crate::models::{Position, Trade};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Redis-backed position store
///
/// Keys:
/// * `position:{instrument}` - JSON of the open position (absent when flat)
/// * `trades:{instrument}` - list of closed trades as JSON, appended on close
pub struct RedisPositionStore {
    conn: ConnectionManager,
    trade_journal_cap: usize,
}

impl RedisPositionStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;

        let conn = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| StoreError::ConnectTimeout(CONNECT_TIMEOUT_SECS))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            trade_journal_cap: 1000,
        })
    }

    /// Keep at most `cap` trades per instrument in the journal
    pub fn with_journal_cap(mut self, cap: usize) -> Self {
        self.trade_journal_cap = cap.max(1);
        self
    }

    fn position_key(instrument: &str) -> String {
        format!("position:{}", instrument)
    }

    fn trades_key(instrument: &str) -> String {
        format!("trades:{}", instrument)
    }
}

#[async_trait]
impl PositionStore for RedisPositionStore {
    async fn load_position(&self, instrument: &str) -> Result<Option<Position>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::position_key(instrument)).await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(position)?;
        conn.set::<_, _, ()>(Self::position_key(&position.instrument), json)
            .await?;

        tracing::debug!("Saved open position for {} to Redis", position.instrument);
        Ok(())
    }

    async fn clear_position(&self, instrument: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::position_key(instrument)).await?;
        Ok(())
    }

    async fn record_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = Self::trades_key(trade.instrument());
        let json = serde_json::to_string(trade)?;

        conn.rpush::<_, _, ()>(&key, json).await?;
        // Trim journal from the front
        let cap = self.trade_journal_cap as isize;
        conn.ltrim::<_, ()>(&key, -cap, -1).await?;

        Ok(())
    }

    async fn recent_trades(&self, instrument: &str, limit: usize) -> Result<Vec<Trade>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(Self::trades_key(instrument), -(limit as isize), -1)
            .await?;

        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, Fill, Side};
    use chrono::Utc;

    const REDIS_URL: &str = "redis://127.0.0.1:6379";

    fn position(instrument: &str) -> Position {
        Position {
            instrument: instrument.to_string(),
            side: Side::Short,
            entry_price: 50_000.0,
            entry_time: Utc::now(),
            size: 0.002,
            leverage: 3,
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        let result = RedisPositionStore::connect("redis://192.0.2.1:6379").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_position_round_trip() {
        let store = RedisPositionStore::connect(REDIS_URL)
            .await
            .expect("Failed to connect to Redis");

        store.clear_position("TEST_POSITION").await.unwrap();
        assert!(store.load_position("TEST_POSITION").await.unwrap().is_none());

        store.save_position(&position("TEST_POSITION")).await.unwrap();
        let loaded = store.load_position("TEST_POSITION").await.unwrap().unwrap();
        assert_eq!(loaded.side, Side::Short);
        assert_eq!(loaded.leverage, 3);

        store.clear_position("TEST_POSITION").await.unwrap();
        assert!(store.load_position("TEST_POSITION").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_trade_journal_is_capped() {
        let store = RedisPositionStore::connect(REDIS_URL)
            .await
            .expect("Failed to connect to Redis")
            .with_journal_cap(2);

        let mut conn = store.conn.clone();
        let _: () = conn.del("trades:TEST_JOURNAL").await.unwrap();

        for price in [49_000.0, 48_000.0, 47_000.0] {
            let fill = Fill {
                instrument: "TEST_JOURNAL".to_string(),
                side: Side::Long,
                price,
                quantity: 0.002,
                timestamp: Utc::now(),
            };
            let trade = Trade::from_close(position("TEST_JOURNAL"), &fill, ExitReason::Manual);
            store.record_trade(&trade).await.unwrap();
        }

        let trades = store.recent_trades("TEST_JOURNAL", 10).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].exit_price, 48_000.0);
        assert_eq!(trades[1].exit_price, 47_000.0);

        let _: () = conn.del("trades:TEST_JOURNAL").await.unwrap();
    }
}
