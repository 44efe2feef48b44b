use crate::models::{NetflowTick, NetflowWindow, Signal};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Thresholds and cadence for one netflow window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    /// Outflow stronger than this (more negative) is bullish
    pub bullish_below: f64,
    /// Inflow stronger than this is bearish
    pub bearish_above: f64,
    /// How often the source refreshes this window
    pub expected_interval_secs: u64,
}

impl WindowConfig {
    /// Strict inequalities: a value exactly on a threshold is neutral
    pub fn classify(&self, net_flow_usd: f64) -> Signal {
        if net_flow_usd < self.bullish_below {
            Signal::Bullish
        } else if net_flow_usd > self.bearish_above {
            Signal::Bearish
        } else {
            Signal::Neutral
        }
    }

    /// Ticks older than twice the expected interval are stale
    pub fn max_age(&self) -> Duration {
        Duration::seconds(2 * self.expected_interval_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetflowConfig {
    pub five_minute: WindowConfig,
    pub one_hour: WindowConfig,
    /// Crawler timestamps are wall-clock at this UTC offset; unset means this host's zone
    pub csv_utc_offset_minutes: Option<i32>,
    /// Ticks dated further ahead than this are treated as stale
    pub max_clock_skew_secs: u64,
}

impl Default for NetflowConfig {
    fn default() -> Self {
        Self {
            five_minute: WindowConfig {
                bullish_below: -1_000_000.0,
                bearish_above: 1_000_000.0,
                expected_interval_secs: 300,
            },
            one_hour: WindowConfig {
                bullish_below: -5_000_000.0,
                bearish_above: 5_000_000.0,
                expected_interval_secs: 300,
            },
            csv_utc_offset_minutes: None,
            max_clock_skew_secs: 60,
        }
    }
}

impl NetflowConfig {
    pub fn window(&self, window: NetflowWindow) -> &WindowConfig {
        match window {
            NetflowWindow::FiveMinutes => &self.five_minute,
            NetflowWindow::OneHour => &self.one_hour,
        }
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::seconds(self.max_clock_skew_secs as i64)
    }

    /// Directional read of one window; stale or absent data is neutral
    pub fn classify(&self, window: NetflowWindow, reading: &NetflowReading) -> Signal {
        match reading {
            NetflowReading::Fresh(tick) => self.window(window).classify(tick.net_flow_usd),
            NetflowReading::Stale(_) | NetflowReading::Absent => Signal::Neutral,
        }
    }
}

/// Latest value for a window, tagged by freshness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetflowReading {
    Fresh(NetflowTick),
    Stale(NetflowTick),
    Absent,
}

impl NetflowReading {
    pub fn value(&self) -> Option<f64> {
        match self {
            NetflowReading::Fresh(t) | NetflowReading::Stale(t) => Some(t.net_flow_usd),
            NetflowReading::Absent => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, NetflowReading::Fresh(_))
    }
}

/// Latest tick per window for one instrument
///
/// This is the immutable value the netflow producer publishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetflowView {
    pub five_minute: Option<NetflowTick>,
    pub one_hour: Option<NetflowTick>,
}

impl NetflowView {
    pub fn get(&self, window: NetflowWindow) -> Option<&NetflowTick> {
        match window {
            NetflowWindow::FiveMinutes => self.five_minute.as_ref(),
            NetflowWindow::OneHour => self.one_hour.as_ref(),
        }
    }

    fn slot_mut(&mut self, window: NetflowWindow) -> &mut Option<NetflowTick> {
        match window {
            NetflowWindow::FiveMinutes => &mut self.five_minute,
            NetflowWindow::OneHour => &mut self.one_hour,
        }
    }

    /// Keep `tick` if it is newer than what the window holds
    pub fn update(&mut self, tick: NetflowTick) -> bool {
        let slot = self.slot_mut(tick.window);
        let newer = slot
            .as_ref()
            .map_or(true, |current| tick.timestamp > current.timestamp);
        if newer {
            *slot = Some(tick);
        }
        newer
    }

    pub fn reading(
        &self,
        window: NetflowWindow,
        config: &NetflowConfig,
        now: DateTime<Utc>,
    ) -> NetflowReading {
        match self.get(window) {
            None => NetflowReading::Absent,
            Some(tick) => {
                let age = now - tick.timestamp;
                // A tick from the future means a misread clock, not fresh data
                if age <= config.window(window).max_age() && -age <= config.max_clock_skew() {
                    NetflowReading::Fresh(tick.clone())
                } else {
                    NetflowReading::Stale(tick.clone())
                }
            }
        }
    }
}

/// Latest netflow per instrument and window
#[derive(Debug, Clone)]
pub struct NetflowAggregator {
    config: NetflowConfig,
    latest: HashMap<String, NetflowView>,
}

impl NetflowAggregator {
    pub fn new(config: NetflowConfig) -> Self {
        Self {
            config,
            latest: HashMap::new(),
        }
    }

    pub fn config(&self) -> &NetflowConfig {
        &self.config
    }

    /// Store the tick if it is newer than the current one for its instrument+window
    pub fn update(&mut self, tick: NetflowTick) -> bool {
        let instrument = tick.instrument.clone();
        let window = tick.window;
        let replaced = self.latest.entry(instrument.clone()).or_default().update(tick);
        if !replaced {
            tracing::debug!(
                instrument = %instrument,
                window = %window,
                "Ignoring netflow tick that is not newer than the stored one"
            );
        }
        replaced
    }

    pub fn latest(
        &self,
        instrument: &str,
        window: NetflowWindow,
        now: DateTime<Utc>,
    ) -> NetflowReading {
        self.latest
            .get(instrument)
            .map(|view| view.reading(window, &self.config, now))
            .unwrap_or(NetflowReading::Absent)
    }

    /// Copy of the latest ticks for an instrument
    pub fn view(&self, instrument: &str) -> NetflowView {
        self.latest.get(instrument).cloned().unwrap_or_default()
    }

    pub fn instruments(&self) -> Vec<String> {
        self.latest.keys().cloned().collect()
    }
}
