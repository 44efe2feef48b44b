use super::gateway::{with_timeout, GatewayError, OrderGateway};
use crate::models::{ExitReason, Fill, Position, Side, Signal, Trade};
use crate::persistence::PositionStore;
use crate::risk::RiskProfile;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Deadline for every gateway call
    pub call_timeout_secs: u64,
    /// Failed closes tolerated before every further failure raises a stuck-open alert
    pub max_close_attempts: u32,
    /// Closed trades kept in memory for display, reloaded from the store on reconcile
    pub recent_trades: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: 10,
            max_close_attempts: 5,
            recent_trades: 10,
        }
    }
}

impl LifecycleSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    pub position: Position,
    /// Exit reason of a close the gateway has not confirmed yet
    pub pending_exit: Option<ExitReason>,
    pub close_failures: u32,
}

impl OpenPosition {
    fn new(position: Position) -> Self {
        Self {
            position,
            pending_exit: None,
            close_failures: 0,
        }
    }
}

/// Why automated trading stopped for an instrument
#[derive(Debug, Clone, PartialEq)]
pub enum Mismatch {
    /// Stored state and gateway disagree
    Diverged {
        local: Option<Position>,
        gateway: Option<Position>,
    },
    /// An open order failed ambiguously and the gateway could not be asked whether it executed
    UnconfirmedOpen { side: Side },
}

fn describe(position: &Option<Position>) -> String {
    match position {
        Some(p) => format!("{} {} @ {:.2}", p.side, p.size, p.entry_price),
        None => "flat".to_string(),
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Diverged { local, gateway } => write!(
                f,
                "local {} vs gateway {}",
                describe(local),
                describe(gateway)
            ),
            Mismatch::UnconfirmedOpen { side } => {
                write!(f, "{} open has unknown outcome", side)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionState {
    Flat,
    Open(OpenPosition),
    /// Needs operator resolution before signals are acted on again
    Halted(Mismatch),
}

impl PositionState {
    pub fn label(&self) -> &'static str {
        match self {
            PositionState::Flat => "FLAT",
            PositionState::Open(_) => "OPEN",
            PositionState::Halted(_) => "HALTED",
        }
    }

    pub fn position(&self) -> Option<&Position> {
        match self {
            PositionState::Open(open) => Some(&open.position),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Opened(Position),
    EntryFailed {
        side: Side,
        error: GatewayError,
    },
    SignalIgnored {
        signal: Signal,
        state: &'static str,
    },
    /// Monitoring found no exit condition
    Holding {
        return_pct: Option<f64>,
    },
    Closed(Trade),
    CloseFailed {
        reason: ExitReason,
        attempts: u32,
        error: GatewayError,
    },
    /// Close keeps failing past the configured bound
    StuckOpen {
        reason: ExitReason,
        attempts: u32,
        error: GatewayError,
    },
    Halted(Mismatch),
}

/// FLAT -> OPEN -> FLAT state machine for one instrument
///
/// Owns the instrument's position state exclusively. Every transition is
/// confirmed by the gateway first; a close is never assumed.
pub struct PositionLifecycle {
    instrument: String,
    risk: RiskProfile,
    settings: LifecycleSettings,
    gateway: Arc<dyn OrderGateway>,
    store: Arc<dyn PositionStore>,
    state: PositionState,
    recent_trades: Vec<Trade>,
}

impl PositionLifecycle {
    pub fn new(
        instrument: impl Into<String>,
        risk: RiskProfile,
        settings: LifecycleSettings,
        gateway: Arc<dyn OrderGateway>,
        store: Arc<dyn PositionStore>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            risk,
            settings,
            gateway,
            store,
            state: PositionState::Flat,
            recent_trades: Vec::new(),
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn risk(&self) -> &RiskProfile {
        &self.risk
    }

    pub fn last_trade(&self) -> Option<&Trade> {
        self.recent_trades.last()
    }

    /// Latest closed trades, oldest first
    pub fn recent_trades(&self) -> &[Trade] {
        &self.recent_trades
    }

    fn remember_trade(&mut self, trade: Trade) {
        self.recent_trades.push(trade);
        let excess = self
            .recent_trades
            .len()
            .saturating_sub(self.settings.recent_trades);
        self.recent_trades.drain(..excess);
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, PositionState::Halted(_))
    }

    /// Act on a fused signal
    ///
    /// Only a FLAT lifecycle opens; OPEN and HALTED report the signal as ignored.
    pub async fn on_signal(&mut self, signal: Signal) -> Option<LifecycleEvent> {
        let side = match (&self.state, signal.side()) {
            (_, None) => return None,
            (PositionState::Flat, Some(side)) => side,
            (state, Some(_)) => {
                tracing::debug!(
                    instrument = %self.instrument,
                    "Ignoring {} signal while {}",
                    signal,
                    state.label()
                );
                return Some(LifecycleEvent::SignalIgnored {
                    signal,
                    state: state.label(),
                });
            }
        };

        let size = match self.order_size().await {
            Ok(size) => size,
            Err(error) => {
                tracing::warn!(
                    instrument = %self.instrument,
                    "❌ Cannot size {} order: {} (staying flat)",
                    side,
                    error
                );
                return Some(LifecycleEvent::EntryFailed { side, error });
            }
        };

        let limit = self.settings.call_timeout();
        let result = with_timeout(
            limit,
            self.gateway
                .open_position(&self.instrument, side, size, self.risk.leverage),
        )
        .await;

        match result {
            Ok(fill) => {
                let position = Position::from_fill(&fill, self.risk.leverage);
                tracing::info!(
                    instrument = %self.instrument,
                    "🟢 Opened {} {} @ ${:.2} (size {}, {}x) on {} signal",
                    position.side,
                    self.instrument,
                    position.entry_price,
                    position.size,
                    position.leverage,
                    signal
                );
                self.enter_open(position.clone()).await;
                Some(LifecycleEvent::Opened(position))
            }
            Err(error) if error.is_definite_rejection() => {
                tracing::warn!(
                    instrument = %self.instrument,
                    "❌ Open {} rejected: {} (staying flat)",
                    side,
                    error
                );
                Some(LifecycleEvent::EntryFailed { side, error })
            }
            Err(error) => {
                tracing::warn!(
                    instrument = %self.instrument,
                    "⏱️ Open {} unsettled ({}), checking gateway",
                    side,
                    error
                );
                Some(self.settle_unknown_open(side, error).await)
            }
        }
    }

    /// Fixed size, or a share of the available balance at the current price
    async fn order_size(&self) -> Result<f64, GatewayError> {
        let Some(pct) = self.risk.balance_pct else {
            return Ok(self.risk.size);
        };

        let limit = self.settings.call_timeout();
        let balance = with_timeout(limit, self.gateway.available_balance()).await?;
        let price = with_timeout(limit, self.gateway.current_price(&self.instrument)).await?;

        self.risk.balance_size(balance, price).ok_or_else(|| {
            GatewayError::Rejected(format!(
                "{}% of balance {:.2} buys nothing at {:.2}",
                pct, balance, price
            ))
        })
    }

    /// The order may have executed even though the call failed; ask the gateway
    async fn settle_unknown_open(&mut self, side: Side, error: GatewayError) -> LifecycleEvent {
        let limit = self.settings.call_timeout();
        match with_timeout(limit, self.gateway.current_position(&self.instrument)).await {
            Ok(Some(position)) => {
                tracing::warn!(
                    instrument = %self.instrument,
                    "Open executed despite {}, tracking {} @ ${:.2}",
                    error,
                    position.side,
                    position.entry_price
                );
                self.enter_open(position.clone()).await;
                LifecycleEvent::Opened(position)
            }
            Ok(None) => LifecycleEvent::EntryFailed { side, error },
            Err(query_error) => {
                let mismatch = Mismatch::UnconfirmedOpen { side };
                tracing::error!(
                    instrument = %self.instrument,
                    "🛑 HALTED: {} ({}, then {})",
                    mismatch,
                    error,
                    query_error
                );
                self.state = PositionState::Halted(mismatch.clone());
                LifecycleEvent::Halted(mismatch)
            }
        }
    }

    /// One monitoring cycle (live trading - uses current time)
    pub async fn monitor(&mut self) -> Option<LifecycleEvent> {
        self.monitor_at(Utc::now()).await
    }

    /// One monitoring cycle with explicit timestamp (for backtesting)
    ///
    /// Retries a pending close first; otherwise checks take profit, stop loss
    /// and timeout in that order.
    pub async fn monitor_at(&mut self, now: DateTime<Utc>) -> Option<LifecycleEvent> {
        let (position, pending) = match &self.state {
            PositionState::Open(open) => (open.position.clone(), open.pending_exit),
            _ => return None,
        };

        let reason = match pending {
            Some(reason) => reason,
            None => {
                let limit = self.settings.call_timeout();
                let price =
                    match with_timeout(limit, self.gateway.current_price(&self.instrument)).await {
                        Ok(price) => Some(price),
                        Err(error) => {
                            tracing::warn!(
                                instrument = %self.instrument,
                                "⚠️ Price unavailable ({}), only timeout can fire",
                                error
                            );
                            None
                        }
                    };

                match self.risk.exit_reason(&position, price, now) {
                    Some(reason) => {
                        tracing::info!(
                            instrument = %self.instrument,
                            "Exit triggered: {} (price {})",
                            reason,
                            price.map_or("n/a".to_string(), |p| format!("${:.2}", p))
                        );
                        reason
                    }
                    None => {
                        return Some(LifecycleEvent::Holding {
                            return_pct: price.map(|p| position.unrealized_return_pct(p)),
                        })
                    }
                }
            }
        };

        Some(self.close_with(position, reason, now).await)
    }

    /// Operator-requested close through the same confirm-before-close path
    pub async fn close_manual(&mut self, now: DateTime<Utc>) -> anyhow::Result<LifecycleEvent> {
        let (position, reason) = match &mut self.state {
            PositionState::Open(open) => {
                let reason = *open.pending_exit.get_or_insert(ExitReason::Manual);
                (open.position.clone(), reason)
            }
            other => anyhow::bail!(
                "No open position to close for {} (state {})",
                self.instrument,
                other.label()
            ),
        };

        Ok(self.close_with(position, reason, now).await)
    }

    async fn close_with(
        &mut self,
        position: Position,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> LifecycleEvent {
        let limit = self.settings.call_timeout();
        let fill = match with_timeout(limit, self.gateway.close_position(&self.instrument)).await {
            Ok(fill) => fill,
            Err(GatewayError::NoPosition(instrument)) => {
                match self.confirm_already_flat(&position, now).await {
                    Some(fill) => fill,
                    None => {
                        return self
                            .record_close_failure(reason, GatewayError::NoPosition(instrument))
                    }
                }
            }
            Err(error) => return self.record_close_failure(reason, error),
        };

        self.finish_close(position, fill, reason).await
    }

    /// Gateway has nothing to close: an earlier timed-out close probably executed
    ///
    /// Returns a fill at the current mark only if the gateway confirms it is flat.
    async fn confirm_already_flat(&self, position: &Position, now: DateTime<Utc>) -> Option<Fill> {
        let limit = self.settings.call_timeout();
        match with_timeout(limit, self.gateway.current_position(&self.instrument)).await {
            Ok(None) => {}
            _ => return None,
        }
        let price = with_timeout(limit, self.gateway.current_price(&self.instrument))
            .await
            .ok()?;

        tracing::warn!(
            instrument = %self.instrument,
            "Gateway already flat, recording exit at mark ${:.2}",
            price
        );

        Some(Fill {
            instrument: self.instrument.clone(),
            side: position.side.opposite(),
            price,
            quantity: position.size,
            timestamp: now,
        })
    }

    fn record_close_failure(&mut self, reason: ExitReason, error: GatewayError) -> LifecycleEvent {
        let max_attempts = self.settings.max_close_attempts;
        let PositionState::Open(open) = &mut self.state else {
            return LifecycleEvent::CloseFailed {
                reason,
                attempts: 0,
                error,
            };
        };

        let reason = *open.pending_exit.get_or_insert(reason);
        open.close_failures += 1;
        let attempts = open.close_failures;

        if attempts > max_attempts {
            tracing::error!(
                instrument = %self.instrument,
                "🚨 STUCK OPEN: close ({}) failed {} times: {}",
                reason,
                attempts,
                error
            );
            LifecycleEvent::StuckOpen {
                reason,
                attempts,
                error,
            }
        } else {
            tracing::warn!(
                instrument = %self.instrument,
                "Close ({}) failed (attempt {}/{}): {}, retrying next cycle",
                reason,
                attempts,
                max_attempts,
                error
            );
            LifecycleEvent::CloseFailed {
                reason,
                attempts,
                error,
            }
        }
    }

    async fn finish_close(
        &mut self,
        position: Position,
        fill: Fill,
        reason: ExitReason,
    ) -> LifecycleEvent {
        let trade = Trade::from_close(position, &fill, reason);
        self.state = PositionState::Flat;

        tracing::info!(
            instrument = %self.instrument,
            "🔴 Closed {} {} @ ${:.2} ({}): {:+.2}% / P&L ${:.2}, held {}m",
            trade.position.side,
            self.instrument,
            trade.exit_price,
            reason,
            trade.return_pct,
            trade.realized_pnl,
            trade.holding_minutes()
        );

        if let Err(e) = self.store.clear_position(&self.instrument).await {
            tracing::warn!(instrument = %self.instrument, "Failed to clear stored position: {}", e);
        }
        if let Err(e) = self.store.record_trade(&trade).await {
            tracing::warn!(instrument = %self.instrument, "Failed to journal trade: {}", e);
        }

        self.remember_trade(trade.clone());
        LifecycleEvent::Closed(trade)
    }

    async fn enter_open(&mut self, position: Position) {
        if let Err(e) = self.store.save_position(&position).await {
            tracing::warn!(instrument = %self.instrument, "Failed to persist open position: {}", e);
        }
        self.state = PositionState::Open(OpenPosition::new(position));
    }

    /// Compare the stored position with the gateway's and set the starting state
    ///
    /// Same side on both: OPEN with the stored entry time. Both absent: FLAT.
    /// Anything else halts until `adopt_gateway_position` or `resolve_flat`.
    pub async fn reconcile(&mut self) -> anyhow::Result<PositionState> {
        let local = self
            .store
            .load_position(&self.instrument)
            .await
            .with_context(|| format!("Failed to load stored position for {}", self.instrument))?;
        let gateway = with_timeout(
            self.settings.call_timeout(),
            self.gateway.current_position(&self.instrument),
        )
        .await
        .with_context(|| format!("Failed to query gateway position for {}", self.instrument))?;

        match self
            .store
            .recent_trades(&self.instrument, self.settings.recent_trades)
            .await
        {
            Ok(trades) => self.recent_trades = trades,
            Err(e) => tracing::warn!(instrument = %self.instrument, "Failed to load trade journal: {}", e),
        }

        self.state = match (local, gateway) {
            (None, None) => {
                tracing::info!(instrument = %self.instrument, "Reconciled: flat");
                PositionState::Flat
            }
            (Some(local), Some(remote)) if local.side == remote.side => {
                tracing::info!(
                    instrument = %self.instrument,
                    "Reconciled: resuming {} @ ${:.2} opened {}",
                    local.side,
                    local.entry_price,
                    local.entry_time
                );
                PositionState::Open(OpenPosition::new(local))
            }
            (local, gateway) => {
                let mismatch = Mismatch::Diverged { local, gateway };
                tracing::error!(
                    instrument = %self.instrument,
                    "🛑 HALTED: reconciliation mismatch, {}",
                    mismatch
                );
                PositionState::Halted(mismatch)
            }
        };

        Ok(self.state.clone())
    }

    /// Take over whatever the gateway holds, with the clock starting now
    pub async fn adopt_gateway_position(
        &mut self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PositionState> {
        if let PositionState::Open(_) = self.state {
            anyhow::bail!("{} already tracks an open position", self.instrument);
        }

        let gateway = with_timeout(
            self.settings.call_timeout(),
            self.gateway.current_position(&self.instrument),
        )
        .await
        .with_context(|| format!("Failed to query gateway position for {}", self.instrument))?;

        match gateway {
            Some(mut position) => {
                position.entry_time = now;
                tracing::info!(
                    instrument = %self.instrument,
                    "Adopted gateway position {} @ ${:.2}",
                    position.side,
                    position.entry_price
                );
                self.enter_open(position).await;
            }
            None => {
                self.store.clear_position(&self.instrument).await?;
                tracing::info!(instrument = %self.instrument, "Gateway flat, nothing to adopt");
                self.state = PositionState::Flat;
            }
        }

        Ok(self.state.clone())
    }

    /// Drop local state once the operator has flattened the exchange
    pub async fn resolve_flat(&mut self) -> anyhow::Result<()> {
        let gateway = with_timeout(
            self.settings.call_timeout(),
            self.gateway.current_position(&self.instrument),
        )
        .await
        .with_context(|| format!("Failed to query gateway position for {}", self.instrument))?;

        if let Some(position) = gateway {
            anyhow::bail!(
                "Gateway still holds {} {} for {}; flatten it first or adopt it",
                position.side,
                position.size,
                self.instrument
            );
        }

        self.store.clear_position(&self.instrument).await?;
        self.state = PositionState::Flat;
        tracing::info!(instrument = %self.instrument, "Resolved to flat");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::paper::{PaperGateway, PaperOp};
    use crate::persistence::MemoryPositionStore;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    const SYMBOL: &str = "BTCUSDT";

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Harness {
        gateway: Arc<PaperGateway>,
        store: Arc<MemoryPositionStore>,
        lifecycle: PositionLifecycle,
    }

    fn harness_with(settings: LifecycleSettings) -> Harness {
        let gateway = Arc::new(PaperGateway::new());
        gateway.mark_price(SYMBOL, 100.0);
        gateway.set_clock(Some(t0()));
        let store = Arc::new(MemoryPositionStore::new());
        let lifecycle = PositionLifecycle::new(
            SYMBOL,
            RiskProfile {
                size: 1.0,
                ..Default::default()
            },
            settings,
            gateway.clone(),
            store.clone(),
        );
        Harness {
            gateway,
            store,
            lifecycle,
        }
    }

    fn harness() -> Harness {
        harness_with(LifecycleSettings::default())
    }

    async fn open_long(h: &mut Harness) {
        let event = h.lifecycle.on_signal(Signal::Bullish).await;
        assert!(matches!(event, Some(LifecycleEvent::Opened(_))));
    }

    #[tokio::test]
    async fn test_bullish_opens_long_from_fill() {
        let mut h = harness();
        let event = h.lifecycle.on_signal(Signal::Bullish).await;

        let Some(LifecycleEvent::Opened(position)) = event else {
            panic!("expected open, got {:?}", event);
        };
        assert_eq!(position.side, Side::Long);
        assert_eq!(position.entry_price, 100.0);
        assert_eq!(position.entry_time, t0());
        assert_eq!(h.lifecycle.state().label(), "OPEN");
        assert!(h.store.load_position(SYMBOL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bearish_opens_short() {
        let mut h = harness();
        h.lifecycle.on_signal(Signal::Bearish).await;
        assert_eq!(h.lifecycle.state().position().unwrap().side, Side::Short);
    }

    #[tokio::test]
    async fn test_neutral_does_nothing() {
        let mut h = harness();
        assert_eq!(h.lifecycle.on_signal(Signal::Neutral).await, None);
        assert_eq!(h.lifecycle.state(), &PositionState::Flat);
        assert_eq!(h.gateway.stats().opens, 0);
    }

    #[tokio::test]
    async fn test_signals_ignored_while_open() {
        let mut h = harness();
        open_long(&mut h).await;

        let event = h.lifecycle.on_signal(Signal::Bearish).await;
        assert_eq!(
            event,
            Some(LifecycleEvent::SignalIgnored {
                signal: Signal::Bearish,
                state: "OPEN"
            })
        );
        h.lifecycle.on_signal(Signal::Bullish).await;
        assert_eq!(h.gateway.stats().opens, 1);
        assert_eq!(h.gateway.stats().rejected_opens, 0);
    }

    #[tokio::test]
    async fn test_entry_failure_stays_flat() {
        let mut h = harness();
        h.gateway.inject_failures(PaperOp::Open, 1);

        let event = h.lifecycle.on_signal(Signal::Bullish).await;
        assert!(matches!(
            event,
            Some(LifecycleEvent::EntryFailed {
                side: Side::Long,
                ..
            })
        ));
        assert_eq!(h.lifecycle.state(), &PositionState::Flat);

        // Next cycle may retry if the signal persists
        open_long(&mut h).await;
    }

    #[tokio::test]
    async fn test_take_profit_at_105() {
        let mut h = harness();
        open_long(&mut h).await;
        h.gateway.mark_price(SYMBOL, 105.0);

        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::minutes(5)).await;
        let Some(LifecycleEvent::Closed(trade)) = event else {
            panic!("expected close, got {:?}", event);
        };
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(trade.exit_price, 105.0);
        assert_eq!(h.lifecycle.state(), &PositionState::Flat);
        assert!(h.store.load_position(SYMBOL).await.unwrap().is_none());
        assert_eq!(h.store.recent_trades(SYMBOL, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_loss_at_90() {
        let mut h = harness();
        open_long(&mut h).await;
        h.gateway.mark_price(SYMBOL, 90.0);

        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::minutes(5)).await;
        let Some(LifecycleEvent::Closed(trade)) = event else {
            panic!("expected close, got {:?}", event);
        };
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
    }

    #[tokio::test]
    async fn test_timeout_after_one_hour() {
        let mut h = harness();
        open_long(&mut h).await;

        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::minutes(59)).await;
        assert!(matches!(event, Some(LifecycleEvent::Holding { .. })));

        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::hours(1)).await;
        let Some(LifecycleEvent::Closed(trade)) = event else {
            panic!("expected close, got {:?}", event);
        };
        assert_eq!(trade.exit_reason, ExitReason::Timeout);
    }

    #[tokio::test]
    async fn test_take_profit_wins_over_timeout() {
        let mut h = harness();
        open_long(&mut h).await;
        h.gateway.mark_price(SYMBOL, 107.0);

        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::hours(3)).await;
        let Some(LifecycleEvent::Closed(trade)) = event else {
            panic!("expected close, got {:?}", event);
        };
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
    }

    #[tokio::test]
    async fn test_timeout_fires_without_price() {
        let mut h = harness();
        open_long(&mut h).await;
        h.gateway.inject_failures(PaperOp::Price, 1);

        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::minutes(61)).await;
        let Some(LifecycleEvent::Closed(trade)) = event else {
            panic!("expected close, got {:?}", event);
        };
        assert_eq!(trade.exit_reason, ExitReason::Timeout);
    }

    #[tokio::test]
    async fn test_holding_reports_return() {
        let mut h = harness();
        open_long(&mut h).await;
        h.gateway.mark_price(SYMBOL, 102.0);

        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::minutes(1)).await;
        assert_eq!(
            event,
            Some(LifecycleEvent::Holding {
                return_pct: Some(2.0)
            })
        );
    }

    #[tokio::test]
    async fn test_failed_close_retried_with_original_reason() {
        let mut h = harness();
        open_long(&mut h).await;
        h.gateway.mark_price(SYMBOL, 106.0);
        h.gateway.inject_failures(PaperOp::Close, 2);

        let now = t0() + ChronoDuration::minutes(5);
        let event = h.lifecycle.monitor_at(now).await;
        assert!(matches!(
            event,
            Some(LifecycleEvent::CloseFailed {
                reason: ExitReason::TakeProfit,
                attempts: 1,
                ..
            })
        ));
        assert_eq!(h.lifecycle.state().label(), "OPEN");

        // Price falls back inside the bands; the pending close still goes through
        h.gateway.mark_price(SYMBOL, 100.0);
        let event = h.lifecycle.monitor_at(now).await;
        assert!(matches!(
            event,
            Some(LifecycleEvent::CloseFailed { attempts: 2, .. })
        ));

        let event = h.lifecycle.monitor_at(now).await;
        let Some(LifecycleEvent::Closed(trade)) = event else {
            panic!("expected close, got {:?}", event);
        };
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(trade.exit_price, 100.0);
    }

    #[tokio::test]
    async fn test_stuck_open_alert_after_bound() {
        let mut h = harness_with(LifecycleSettings {
            max_close_attempts: 2,
            ..Default::default()
        });
        open_long(&mut h).await;
        h.gateway.mark_price(SYMBOL, 80.0);
        h.gateway.inject_failures(PaperOp::Close, 4);

        let now = t0() + ChronoDuration::minutes(5);
        let mut stuck = 0;
        for _ in 0..4 {
            if let Some(LifecycleEvent::StuckOpen { attempts, reason, .. }) =
                h.lifecycle.monitor_at(now).await
            {
                assert!(attempts > 2);
                assert_eq!(reason, ExitReason::StopLoss);
                stuck += 1;
            }
        }
        assert_eq!(stuck, 2);
        assert_eq!(h.lifecycle.state().label(), "OPEN");

        assert!(matches!(
            h.lifecycle.monitor_at(now).await,
            Some(LifecycleEvent::Closed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_close_is_not_success() {
        let mut h = harness_with(LifecycleSettings {
            call_timeout_secs: 1,
            ..Default::default()
        });
        open_long(&mut h).await;
        h.gateway.mark_price(SYMBOL, 110.0);
        h.gateway.inject_failures(PaperOp::Close, 1);

        let now = t0() + ChronoDuration::minutes(5);
        h.lifecycle.monitor_at(now).await;

        // Retry of the pending close hangs past the deadline
        h.gateway.set_latency(Some(Duration::from_secs(5)));
        let event = h.lifecycle.monitor_at(now).await;
        assert!(matches!(
            event,
            Some(LifecycleEvent::CloseFailed {
                error: GatewayError::Timeout(_),
                ..
            })
        ));
        assert_eq!(h.lifecycle.state().label(), "OPEN");
        assert_eq!(h.gateway.open_positions(), 1);

        h.gateway.set_latency(None);
        assert!(matches!(
            h.lifecycle.monitor_at(now).await,
            Some(LifecycleEvent::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_confirmed_when_gateway_already_flat() {
        let mut h = harness();
        open_long(&mut h).await;

        // Close went through on an earlier attempt that was reported as failed
        h.gateway.close_position(SYMBOL).await.unwrap();
        h.gateway.mark_price(SYMBOL, 89.0);

        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::minutes(5)).await;
        let Some(LifecycleEvent::Closed(trade)) = event else {
            panic!("expected close, got {:?}", event);
        };
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_price, 89.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_open_halts() {
        let mut h = harness_with(LifecycleSettings {
            call_timeout_secs: 1,
            ..Default::default()
        });
        h.gateway.set_latency(Some(Duration::from_secs(5)));

        let event = h.lifecycle.on_signal(Signal::Bullish).await;
        assert_eq!(
            event,
            Some(LifecycleEvent::Halted(Mismatch::UnconfirmedOpen {
                side: Side::Long
            }))
        );
        assert!(h.lifecycle.is_halted());

        h.gateway.set_latency(None);
        let event = h.lifecycle.on_signal(Signal::Bullish).await;
        assert!(matches!(
            event,
            Some(LifecycleEvent::SignalIgnored { state: "HALTED", .. })
        ));
        assert_eq!(h.lifecycle.monitor_at(t0()).await, None);
    }

    #[tokio::test]
    async fn test_open_executed_then_errored_is_tracked() {
        let mut h = harness();
        h.gateway.lose_responses(PaperOp::Open, 1);

        let event = h.lifecycle.on_signal(Signal::Bullish).await;
        let Some(LifecycleEvent::Opened(position)) = event else {
            panic!("expected adopted open, got {:?}", event);
        };
        assert_eq!(position.side, Side::Long);
        assert!(h.store.load_position(SYMBOL).await.unwrap().is_some());

        // The next signal must not add to the broker's position
        h.lifecycle.on_signal(Signal::Bullish).await;
        assert_eq!(h.gateway.stats().opens, 1);
        assert_eq!(h.gateway.stats().rejected_opens, 0);

        // Exits apply to the tracked position
        h.gateway.mark_price(SYMBOL, 106.0);
        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::minutes(5)).await;
        assert!(matches!(event, Some(LifecycleEvent::Closed(_))));
        assert_eq!(h.gateway.open_positions(), 0);
    }

    #[tokio::test]
    async fn test_errored_open_with_unreachable_gateway_halts() {
        let mut h = harness();
        h.gateway.lose_responses(PaperOp::Open, 1);
        h.gateway.inject_failures(PaperOp::Position, 1);

        let event = h.lifecycle.on_signal(Signal::Bearish).await;
        assert_eq!(
            event,
            Some(LifecycleEvent::Halted(Mismatch::UnconfirmedOpen {
                side: Side::Short
            }))
        );

        h.lifecycle.on_signal(Signal::Bearish).await;
        assert_eq!(h.gateway.stats().opens, 1);
    }

    #[tokio::test]
    async fn test_rejected_open_stays_flat_without_position_check() {
        let gateway = Arc::new(PaperGateway::new());
        // No mark for the instrument: the paper broker refuses the order
        gateway.inject_failures(PaperOp::Position, 1);
        let mut lifecycle = PositionLifecycle::new(
            "ETHUSDT",
            RiskProfile::default(),
            LifecycleSettings::default(),
            gateway.clone(),
            Arc::new(MemoryPositionStore::new()),
        );

        let event = lifecycle.on_signal(Signal::Bullish).await;
        assert!(matches!(
            event,
            Some(LifecycleEvent::EntryFailed {
                error: GatewayError::Rejected(_),
                ..
            })
        ));
        assert_eq!(lifecycle.state(), &PositionState::Flat);
        // The injected position failure was never consumed
        assert!(gateway.current_position("ETHUSDT").await.is_err());
    }

    #[tokio::test]
    async fn test_balance_based_size() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.mark_price(SYMBOL, 100.0);
        let risk = RiskProfile {
            leverage: 2,
            balance_pct: Some(10.0),
            ..Default::default()
        };
        let mut lifecycle = PositionLifecycle::new(
            SYMBOL,
            risk,
            LifecycleSettings::default(),
            gateway.clone(),
            Arc::new(MemoryPositionStore::new()),
        );

        // Without a balance nothing is sent
        let event = lifecycle.on_signal(Signal::Bullish).await;
        assert!(matches!(event, Some(LifecycleEvent::EntryFailed { .. })));
        assert_eq!(gateway.stats().opens, 0);

        gateway.set_balance(1000.0);
        let event = lifecycle.on_signal(Signal::Bullish).await;
        let Some(LifecycleEvent::Opened(position)) = event else {
            panic!("expected open, got {:?}", event);
        };
        assert_eq!(position.size, 2.0);
        assert_eq!(position.leverage, 2);
    }

    #[tokio::test]
    async fn test_manual_close() {
        let mut h = harness();
        assert!(h.lifecycle.close_manual(t0()).await.is_err());

        open_long(&mut h).await;
        h.gateway.mark_price(SYMBOL, 101.0);
        let event = h.lifecycle.close_manual(t0()).await.unwrap();
        let LifecycleEvent::Closed(trade) = event else {
            panic!("expected close, got {:?}", event);
        };
        assert_eq!(trade.exit_reason, ExitReason::Manual);
        assert_eq!(h.lifecycle.last_trade().unwrap().exit_price, 101.0);
    }

    #[tokio::test]
    async fn test_trade_journal_reloaded_and_bounded() {
        let mut h = harness_with(LifecycleSettings {
            recent_trades: 2,
            ..Default::default()
        });
        for exit in [101.0, 102.0, 103.0] {
            open_long(&mut h).await;
            h.gateway.mark_price(SYMBOL, exit);
            h.lifecycle.close_manual(t0()).await.unwrap();
            h.gateway.mark_price(SYMBOL, 100.0);
        }
        let exits: Vec<f64> = h.lifecycle.recent_trades().iter().map(|t| t.exit_price).collect();
        assert_eq!(exits, vec![102.0, 103.0]);

        // A fresh lifecycle over the same store picks the journal back up
        let mut restarted = PositionLifecycle::new(
            SYMBOL,
            RiskProfile::default(),
            LifecycleSettings {
                recent_trades: 2,
                ..Default::default()
            },
            h.gateway.clone(),
            h.store.clone(),
        );
        assert!(restarted.recent_trades().is_empty());
        restarted.reconcile().await.unwrap();
        let exits: Vec<f64> = restarted.recent_trades().iter().map(|t| t.exit_price).collect();
        assert_eq!(exits, vec![102.0, 103.0]);
        assert_eq!(restarted.last_trade().unwrap().exit_price, 103.0);
    }

    #[tokio::test]
    async fn test_reconcile_both_flat() {
        let mut h = harness();
        let state = h.lifecycle.reconcile().await.unwrap();
        assert_eq!(state, PositionState::Flat);
    }

    #[tokio::test]
    async fn test_reconcile_resumes_with_local_entry_time() {
        let mut h = harness();
        let opened_at = t0() - ChronoDuration::minutes(20);
        let local = Position {
            instrument: SYMBOL.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            entry_time: opened_at,
            size: 1.0,
            leverage: 1,
        };
        h.store.save_position(&local).await.unwrap();
        h.gateway.seed_position(Position {
            entry_time: t0(),
            ..local.clone()
        });

        h.lifecycle.reconcile().await.unwrap();
        assert_eq!(
            h.lifecycle.state().position().unwrap().entry_time,
            opened_at
        );

        // 40 minutes later the hour since the stored entry has elapsed
        let event = h.lifecycle.monitor_at(t0() + ChronoDuration::minutes(40)).await;
        assert!(matches!(event, Some(LifecycleEvent::Closed(_))));
    }

    #[tokio::test]
    async fn test_unknown_gateway_position_never_reopened() {
        let mut h = harness();
        h.gateway.seed_position(Position {
            instrument: SYMBOL.to_string(),
            side: Side::Short,
            entry_price: 100.0,
            entry_time: t0(),
            size: 1.0,
            leverage: 1,
        });

        let state = h.lifecycle.reconcile().await.unwrap();
        assert!(matches!(
            state,
            PositionState::Halted(Mismatch::Diverged { local: None, gateway: Some(_) })
        ));

        for signal in [Signal::Bullish, Signal::Bearish, Signal::Bullish] {
            h.lifecycle.on_signal(signal).await;
        }
        assert_eq!(h.gateway.stats().opens, 0);
        assert_eq!(h.gateway.stats().rejected_opens, 0);
    }

    #[tokio::test]
    async fn test_side_mismatch_halts_and_adopt_resolves() {
        let mut h = harness();
        let local = Position {
            instrument: SYMBOL.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            entry_time: t0(),
            size: 1.0,
            leverage: 1,
        };
        h.store.save_position(&local).await.unwrap();
        h.gateway.seed_position(Position {
            side: Side::Short,
            ..local.clone()
        });

        h.lifecycle.reconcile().await.unwrap();
        assert!(h.lifecycle.is_halted());

        let adopted_at = t0() + ChronoDuration::minutes(30);
        let state = h.lifecycle.adopt_gateway_position(adopted_at).await.unwrap();
        let position = state.position().unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.entry_time, adopted_at);
        assert_eq!(
            h.store.load_position(SYMBOL).await.unwrap().unwrap().side,
            Side::Short
        );
    }

    #[tokio::test]
    async fn test_resolve_flat_requires_flat_gateway() {
        let mut h = harness();
        let stale = Position {
            instrument: SYMBOL.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            entry_time: t0(),
            size: 1.0,
            leverage: 1,
        };
        h.store.save_position(&stale).await.unwrap();
        h.gateway.seed_position(Position {
            side: Side::Short,
            ..stale.clone()
        });
        h.lifecycle.reconcile().await.unwrap();

        assert!(h.lifecycle.resolve_flat().await.is_err());
        assert!(h.lifecycle.is_halted());

        h.gateway.close_position(SYMBOL).await.unwrap();
        h.lifecycle.resolve_flat().await.unwrap();
        assert_eq!(h.lifecycle.state(), &PositionState::Flat);
        assert!(h.store.load_position(SYMBOL).await.unwrap().is_none());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Signal(Signal),
        Move(f64),
        Advance(i64),
        FailCloses(usize),
        FailOpens(usize),
        LoseOpenResponses(usize),
        Monitor,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            prop_oneof![
                Just(Signal::Bullish),
                Just(Signal::Bearish),
                Just(Signal::Neutral)
            ]
            .prop_map(Step::Signal),
            (-8.0f64..8.0).prop_map(Step::Move),
            (1i64..30).prop_map(Step::Advance),
            (0usize..3).prop_map(Step::FailCloses),
            (0usize..3).prop_map(Step::FailOpens),
            (0usize..3).prop_map(Step::LoseOpenResponses),
            Just(Step::Monitor),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_position(steps in prop::collection::vec(step(), 1..80)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            rt.block_on(async {
                let mut h = harness();
                let mut now = t0();
                let mut price = 100.0;

                for step in steps {
                    match step {
                        Step::Signal(signal) => {
                            h.lifecycle.on_signal(signal).await;
                        }
                        Step::Move(pct) => {
                            price = (price * (1.0 + pct / 100.0)).max(1.0);
                            h.gateway.mark_price(SYMBOL, price);
                        }
                        Step::Advance(minutes) => {
                            now += ChronoDuration::minutes(minutes);
                            h.gateway.set_clock(Some(now));
                        }
                        Step::FailCloses(n) => h.gateway.inject_failures(PaperOp::Close, n),
                        Step::FailOpens(n) => h.gateway.inject_failures(PaperOp::Open, n),
                        Step::LoseOpenResponses(n) => {
                            h.gateway.lose_responses(PaperOp::Open, n)
                        }
                        Step::Monitor => {
                            h.lifecycle.monitor_at(now).await;
                        }
                    }

                    let stats = h.gateway.stats();
                    assert_eq!(stats.rejected_opens, 0);
                    assert!(h.gateway.open_positions() <= 1);
                    assert_eq!(
                        h.lifecycle.state().position().is_some(),
                        h.gateway.open_positions() == 1
                    );
                    assert_eq!(stats.opens - stats.closes, h.gateway.open_positions());
                }
            });
        }
    }
}
