use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A single closing price for an instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceTick {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub close: f64,
}

impl PriceTick {
    pub fn new(instrument: impl Into<String>, timestamp: DateTime<Utc>, close: f64) -> Self {
        Self {
            instrument: instrument.into(),
            timestamp,
            close,
        }
    }
}

/// Netflow aggregation window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NetflowWindow {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl NetflowWindow {
    pub const ALL: [NetflowWindow; 2] = [NetflowWindow::FiveMinutes, NetflowWindow::OneHour];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetflowWindow::FiveMinutes => "5m",
            NetflowWindow::OneHour => "1h",
        }
    }
}

impl fmt::Display for NetflowWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Net exchange flow over a window (positive = inflow to exchanges)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetflowTick {
    pub instrument: String,
    pub window: NetflowWindow,
    pub net_flow_usd: f64,
    pub timestamp: DateTime<Utc>,
}

/// Directional verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Bullish,
    Bearish,
    Neutral,
}

impl Signal {
    /// Position side a signal asks for, if any
    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::Bullish => Some(Side::Long),
            Signal::Bearish => Some(Side::Short),
            Signal::Neutral => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Signal::Bullish => "BULLISH",
            Signal::Bearish => "BEARISH",
            Signal::Neutral => "NEUTRAL",
        };
        f.write_str(s)
    }
}

/// Where a signal came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Technical,
    Flow,
    Combined,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => f.write_str("long"),
            Side::Short => f.write_str("short"),
        }
    }
}

/// Execution report from the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    pub instrument: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
}

/// An open position
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub instrument: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub size: f64,
    pub leverage: u32,
}

impl Position {
    /// Build a position from the fill that opened it
    pub fn from_fill(fill: &Fill, leverage: u32) -> Self {
        Self {
            instrument: fill.instrument.clone(),
            side: fill.side,
            entry_price: fill.price,
            entry_time: fill.timestamp,
            size: fill.quantity,
            leverage,
        }
    }

    /// Leverage-adjusted return on margin, in percent
    ///
    /// Shorts use the mirrored sign, so +5% means the same profit for both sides.
    pub fn unrealized_return_pct(&self, current_price: f64) -> f64 {
        self.side.sign() * (current_price - self.entry_price) * self.leverage as f64 * 100.0
            / self.entry_price
    }

    /// Quote-currency P&L if closed at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.size
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Timeout,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Timeout => "timeout",
            ExitReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A closed position
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: Uuid,
    pub position: Position,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub realized_pnl: f64,
    pub return_pct: f64,
}

impl Trade {
    pub fn from_close(position: Position, fill: &Fill, exit_reason: ExitReason) -> Self {
        let realized_pnl = position.pnl_at(fill.price);
        let return_pct = position.unrealized_return_pct(fill.price);
        Self {
            id: Uuid::new_v4(),
            position,
            exit_price: fill.price,
            exit_time: fill.timestamp,
            exit_reason,
            realized_pnl,
            return_pct,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.position.instrument
    }

    pub fn holding_minutes(&self) -> i64 {
        (self.exit_time - self.position.entry_time).num_minutes()
    }
}
