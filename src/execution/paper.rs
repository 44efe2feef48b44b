use super::gateway::{GatewayError, OrderGateway};
use crate::models::{Fill, Position, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Gateway operation, for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Open,
    Close,
    Price,
    Position,
}

/// Order counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperStats {
    pub opens: usize,
    pub closes: usize,
    /// Open orders refused because a position already existed
    pub rejected_opens: usize,
}

#[derive(Default)]
struct PaperState {
    marks: HashMap<String, f64>,
    positions: HashMap<String, Position>,
    failures: HashMap<PaperOp, usize>,
    lost_acks: HashMap<PaperOp, usize>,
    balance: Option<f64>,
    latency: Option<Duration>,
    clock: Option<DateTime<Utc>>,
    stats: PaperStats,
}

/// Simulated broker that fills at the last marked price
///
/// Holds at most one position per instrument. Used as the default live mode,
/// by the backtester, and in tests with injected failures or latency.
#[derive(Default)]
pub struct PaperGateway {
    state: Mutex<PaperState>,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        // A poisoned lock still holds consistent data: no method panics mid-update
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the price orders fill at
    pub fn mark_price(&self, instrument: &str, price: f64) {
        self.state().marks.insert(instrument.to_string(), price);
    }

    /// Pin the fill clock (backtests); `None` uses wall time
    pub fn set_clock(&self, now: Option<DateTime<Utc>>) {
        self.state().clock = now;
    }

    /// Fail the next `count` calls of `op` with a transport error
    pub fn inject_failures(&self, op: PaperOp, count: usize) {
        self.state().failures.insert(op, count);
    }

    /// Execute the next `count` calls of `op` but answer with a transport error
    pub fn lose_responses(&self, op: PaperOp, count: usize) {
        self.state().lost_acks.insert(op, count);
    }

    /// Quote balance reported for balance-based sizing
    pub fn set_balance(&self, balance: f64) {
        self.state().balance = Some(balance);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Place a position directly, as if opened outside this process
    pub fn seed_position(&self, position: Position) {
        self.state()
            .positions
            .insert(position.instrument.clone(), position);
    }

    pub fn stats(&self) -> PaperStats {
        self.state().stats
    }

    pub fn open_positions(&self) -> usize {
        self.state().positions.len()
    }

    /// Common prologue: latency, then injected failure
    async fn enter(&self, op: PaperOp) -> Result<(), GatewayError> {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError::Transport(format!(
                    "injected {:?} failure",
                    op
                )));
            }
        }
        Ok(())
    }
}

impl PaperState {
    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    /// Consume one lost response for `op`, if any are pending
    fn lose_response(&mut self, op: PaperOp) -> Result<(), GatewayError> {
        match self.lost_acks.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(GatewayError::Transport(format!(
                    "connection reset after {:?} executed",
                    op
                )))
            }
            _ => Ok(()),
        }
    }

    fn mark(&self, instrument: &str) -> Result<f64, GatewayError> {
        self.marks
            .get(instrument)
            .copied()
            .ok_or_else(|| GatewayError::Rejected(format!("no price for {}", instrument)))
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn open_position(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        leverage: u32,
    ) -> Result<Fill, GatewayError> {
        self.enter(PaperOp::Open).await?;

        let mut state = self.state();
        if state.positions.contains_key(instrument) {
            state.stats.rejected_opens += 1;
            return Err(GatewayError::Rejected(format!(
                "position already open for {}",
                instrument
            )));
        }
        if !(size > 0.0) || leverage == 0 {
            return Err(GatewayError::Rejected(format!(
                "invalid order size {} / leverage {}",
                size, leverage
            )));
        }

        let price = state.mark(instrument)?;
        let fill = Fill {
            instrument: instrument.to_string(),
            side,
            price,
            quantity: size,
            timestamp: state.now(),
        };

        state
            .positions
            .insert(instrument.to_string(), Position::from_fill(&fill, leverage));
        state.stats.opens += 1;

        tracing::debug!("📝 Paper {} {} {} @ ${:.2}", side, size, instrument, price);
        state.lose_response(PaperOp::Open)?;
        Ok(fill)
    }

    async fn close_position(&self, instrument: &str) -> Result<Fill, GatewayError> {
        self.enter(PaperOp::Close).await?;

        let mut state = self.state();
        let price = state.mark(instrument)?;
        let timestamp = state.now();
        let position = state
            .positions
            .remove(instrument)
            .ok_or_else(|| GatewayError::NoPosition(instrument.to_string()))?;
        state.stats.closes += 1;
        state.lose_response(PaperOp::Close)?;

        Ok(Fill {
            instrument: instrument.to_string(),
            side: position.side.opposite(),
            price,
            quantity: position.size,
            timestamp,
        })
    }

    async fn current_price(&self, instrument: &str) -> Result<f64, GatewayError> {
        self.enter(PaperOp::Price).await?;
        self.state().mark(instrument)
    }

    async fn current_position(&self, instrument: &str) -> Result<Option<Position>, GatewayError> {
        self.enter(PaperOp::Position).await?;
        Ok(self.state().positions.get(instrument).cloned())
    }

    async fn available_balance(&self) -> Result<f64, GatewayError> {
        self.state()
            .balance
            .ok_or_else(|| GatewayError::Rejected("paper balance not set".to_string()))
    }

    fn name(&self) -> &str {
        "paper"
    }
}
