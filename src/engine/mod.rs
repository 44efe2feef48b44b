// Producers, per-instrument traders and the display feed
pub mod display;
pub mod producers;
pub mod trader;

pub use display::{format_flow, run_display_logger, DisplayFrame, SignalHistory, SignalRecord};
pub use producers::{NetflowProducer, PriceProducer};
pub use trader::{Trader, TraderSettings};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Loop cadences, in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Schedule {
    pub price_poll_secs: u64,
    pub netflow_poll_secs: u64,
    pub signal_secs: u64,
    pub monitor_secs: u64,
    /// Seconds after a signal-period boundary to evaluate, leaving producers time to publish
    pub signal_offset_secs: u64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            price_poll_secs: 60,
            netflow_poll_secs: 60,
            signal_secs: 300,
            monitor_secs: 10,
            signal_offset_secs: 30,
        }
    }
}

impl Schedule {
    pub fn trader_settings(&self, history_len: usize, now: DateTime<Utc>) -> TraderSettings {
        TraderSettings {
            signal_interval: Duration::from_secs(self.signal_secs),
            monitor_interval: Duration::from_secs(self.monitor_secs),
            signal_delay: until_next_boundary(now, self.signal_secs)
                + Duration::from_secs(self.signal_offset_secs),
            history_len,
        }
    }
}

/// Time until the next wall-clock multiple of `period_secs` (XX:00, XX:05, ... for 300)
pub fn until_next_boundary(now: DateTime<Utc>, period_secs: u64) -> Duration {
    if period_secs == 0 {
        return Duration::ZERO;
    }
    let seconds_of_day = now.num_seconds_from_midnight() as u64;
    let into_period = seconds_of_day % period_secs;
    if into_period == 0 && now.nanosecond() == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(period_secs - into_period)
    }
}

/// Explicit stop signal shared by every task
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Spawn one instrument's producers and trader
pub fn spawn_instrument(
    price: PriceProducer,
    netflow: NetflowProducer,
    trader: Trader,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(price.run(shutdown.clone())),
        tokio::spawn(netflow.run(shutdown.clone())),
        tokio::spawn(trader.run(shutdown.clone())),
    ]
}
