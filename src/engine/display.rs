use crate::market::{IndicatorSnapshot, NetflowReading};
use crate::models::{Position, Signal, Trade};
use crate::strategy::SignalVerdict;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalRecord {
    pub at: DateTime<Utc>,
    pub technical: Signal,
    pub flow: Signal,
    pub combined: Signal,
}

/// Bounded log of recent verdicts, newest last
#[derive(Debug, Clone)]
pub struct SignalHistory {
    capacity: usize,
    records: VecDeque<SignalRecord>,
}

impl SignalHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, verdict: &SignalVerdict) {
        self.records.push_back(SignalRecord {
            at,
            technical: verdict.technical,
            flow: verdict.flow,
            combined: verdict.combined,
        });
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    pub fn records(&self) -> Vec<SignalRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read-only view of one instrument, published once per cycle
#[derive(Debug, Clone, Serialize)]
pub struct DisplayFrame {
    pub instrument: String,
    pub at: DateTime<Utc>,
    pub indicators: IndicatorSnapshot,
    pub flow_5m: NetflowReading,
    pub flow_1h: NetflowReading,
    pub verdict: SignalVerdict,
    pub state: &'static str,
    pub position: Option<Position>,
    pub unrealized_return_pct: Option<f64>,
    pub halted_reason: Option<String>,
    pub last_trade: Option<Trade>,
    /// Journal tail, oldest first
    pub recent_trades: Vec<Trade>,
    pub history: Vec<SignalRecord>,
}

impl DisplayFrame {
    pub fn empty(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            at: Utc::now(),
            indicators: IndicatorSnapshot::Insufficient {
                samples: 0,
                required: 0,
            },
            flow_5m: NetflowReading::Absent,
            flow_1h: NetflowReading::Absent,
            verdict: SignalVerdict::neutral(),
            state: "FLAT",
            position: None,
            unrealized_return_pct: None,
            halted_reason: None,
            last_trade: None,
            recent_trades: Vec::new(),
            history: Vec::new(),
        }
    }

    /// One-line summary for the log display
    pub fn summary(&self) -> String {
        let market = match &self.indicators {
            IndicatorSnapshot::Ready(i) => format!(
                "${:.2} MA7 {:.2} / MA25 {:.2} RSI {:.1}{}",
                i.close,
                i.ma.short,
                i.ma.long,
                i.rsi,
                match i.crossover {
                    Some(c) => format!(" [{:?} cross]", c),
                    None => String::new(),
                }
            ),
            IndicatorSnapshot::Insufficient { samples, required } => {
                format!("collecting data ({}/{})", samples, required)
            }
        };

        let position = match (&self.position, &self.halted_reason) {
            (Some(p), _) => format!(
                "{} {} @ {:.2}{}",
                self.state,
                p.side,
                p.entry_price,
                self.unrealized_return_pct
                    .map(|r| format!(" {:+.2}%", r))
                    .unwrap_or_default()
            ),
            (None, Some(reason)) => format!("{} ({})", self.state, reason),
            (None, None) => self.state.to_string(),
        };

        let mut line = format!(
            "{} | {} | flow 5m {} 1h {} | tech {} flow {} -> {} | {}",
            self.instrument,
            market,
            format_reading(&self.flow_5m),
            format_reading(&self.flow_1h),
            self.verdict.technical,
            self.verdict.flow,
            self.verdict.combined,
            position
        );
        if !self.recent_trades.is_empty() {
            let wins = self.recent_trades.iter().filter(|t| t.return_pct > 0.0).count();
            let net: f64 = self.recent_trades.iter().map(|t| t.return_pct).sum();
            line.push_str(&format!(
                " | last {} trades: {} won, {:+.2}%",
                self.recent_trades.len(),
                wins,
                net
            ));
        }
        line
    }
}

/// Compact dollar amount: 1.2M, -350.0K, 12.0
pub fn format_flow(value: f64) -> String {
    if value.abs() >= 1_000_000.0 {
        format!("{:.1}M", value / 1_000_000.0)
    } else if value.abs() >= 1_000.0 {
        format!("{:.1}K", value / 1_000.0)
    } else {
        format!("{:.1}", value)
    }
}

fn format_reading(reading: &NetflowReading) -> String {
    match reading {
        NetflowReading::Fresh(t) => format_flow(t.net_flow_usd),
        NetflowReading::Stale(t) => format!("{} (stale)", format_flow(t.net_flow_usd)),
        NetflowReading::Absent => "n/a".to_string(),
    }
}

/// Log every new frame until shutdown
pub async fn run_display_logger(
    mut frames: watch::Receiver<DisplayFrame>,
    mut shutdown: watch::Receiver<bool>,
    json: bool,
) {
    loop {
        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = frames.borrow_and_update().clone();
                if json {
                    match serde_json::to_string(&frame) {
                        Ok(line) => tracing::info!(target: "flowbot::display", "{}", line),
                        Err(e) => tracing::warn!("Failed to encode display frame: {}", e),
                    }
                } else {
                    tracing::info!(target: "flowbot::display", "📊 {}", frame.summary());
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
