use crate::models::{NetflowTick, NetflowWindow, PriceTick};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Netflow (USD) attributed to a 1.0 fractional price move; outflow precedes rallies
const FLOW_PER_RETURN: f64 = 2.0e9;
/// 5m ticks summed into each 1h tick
const TICKS_PER_HOUR: usize = 12;

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-2% daily average)
    Downtrend,
    /// Sideways/choppy market (±1% around mean)
    Sideways,
    /// High volatility (±5% large swings)
    Volatile,
    /// Contains time gaps (missing ticks)
    WithGaps,
    /// Alternating rallies and sell-offs, each preceded by a flow burst
    FlowReversals,
}

impl MarketScenario {
    pub const ALL: [MarketScenario; 6] = [
        MarketScenario::Uptrend,
        MarketScenario::Downtrend,
        MarketScenario::Sideways,
        MarketScenario::Volatile,
        MarketScenario::WithGaps,
        MarketScenario::FlowReversals,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MarketScenario::Uptrend => "📈 Uptrend (+2% daily)",
            MarketScenario::Downtrend => "📉 Downtrend (-2% daily)",
            MarketScenario::Sideways => "↔️  Sideways (mean-reverting)",
            MarketScenario::Volatile => "⚡ Volatile (±5% swings)",
            MarketScenario::WithGaps => "🕳️  With Time Gaps",
            MarketScenario::FlowReversals => "🌊 Flow-led Reversals",
        }
    }
}

/// Prices and the netflow ticks observed alongside them
#[derive(Debug, Clone, Default)]
pub struct SyntheticSeries {
    pub prices: Vec<PriceTick>,
    pub netflow: Vec<NetflowTick>,
}

/// Generates synthetic price and netflow data for backtesting
pub struct SyntheticDataGenerator {
    rng: StdRng,
    instrument: String,
    base_price: f64,
    start: DateTime<Utc>,
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            instrument: "BTCUSDT".to_string(),
            base_price: 60_000.0,
            start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default(),
        }
    }

    pub fn with_instrument(mut self, instrument: impl Into<String>) -> Self {
        self.instrument = instrument.into();
        self
    }

    pub fn with_base_price(mut self, price: f64) -> Self {
        self.base_price = price;
        self
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    /// Generate ticks for a market scenario
    ///
    /// Every emitted price tick comes with a 5m netflow tick; a 1h tick summing
    /// the last twelve 5m flows follows every twelfth one.
    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        num_ticks: usize,
        interval_minutes: i64,
    ) -> SyntheticSeries {
        let mut series = SyntheticSeries {
            prices: Vec::with_capacity(num_ticks),
            netflow: Vec::with_capacity(num_ticks + num_ticks / TICKS_PER_HOUR),
        };
        let mut price = self.base_price;
        let mut slot: i64 = 0;
        let mut hour_window: Vec<f64> = Vec::with_capacity(TICKS_PER_HOUR);

        for i in 0..num_ticks {
            // Skip every 50th tick to create gaps
            if scenario == MarketScenario::WithGaps && i % 50 == 49 {
                slot += 2;
                continue;
            }

            let ret = self.step_return(scenario, i, price);
            let timestamp = self.start + Duration::minutes(slot * interval_minutes);

            // Flow is observed before the move it explains
            let noise = self.rng.gen_range(-500_000.0..500_000.0);
            let flow_5m = -ret * FLOW_PER_RETURN + noise;

            price = (price * (1.0 + ret)).max(self.base_price * 0.1);

            series.netflow.push(self.flow_tick(NetflowWindow::FiveMinutes, flow_5m, timestamp));
            series
                .prices
                .push(PriceTick::new(self.instrument.clone(), timestamp, price));

            hour_window.push(flow_5m);
            if hour_window.len() == TICKS_PER_HOUR {
                let hourly: f64 = hour_window.drain(..).sum();
                series
                    .netflow
                    .push(self.flow_tick(NetflowWindow::OneHour, hourly, timestamp));
            }

            slot += 1;
        }

        series
    }

    /// Fractional price change for tick `i`
    fn step_return(&mut self, scenario: MarketScenario, i: usize, price: f64) -> f64 {
        match scenario {
            MarketScenario::Uptrend => 0.02 / 288.0 + self.rng.gen_range(-0.001..0.001),
            MarketScenario::Downtrend => -0.02 / 288.0 + self.rng.gen_range(-0.001..0.001),
            MarketScenario::Sideways => {
                let reversion = (self.base_price - price) / price * 0.1;
                reversion + self.rng.gen_range(-0.01..0.01)
            }
            MarketScenario::Volatile => self.rng.gen_range(-0.05..0.05),
            MarketScenario::WithGaps => self.rng.gen_range(-0.01..0.01),
            MarketScenario::FlowReversals => {
                // 60-tick legs: rally, then sell-off
                let leg = if (i / 60) % 2 == 0 { 0.003 } else { -0.003 };
                leg + self.rng.gen_range(-0.002..0.002)
            }
        }
    }

    fn flow_tick(&self, window: NetflowWindow, value: f64, timestamp: DateTime<Utc>) -> NetflowTick {
        NetflowTick {
            instrument: self.instrument.clone(),
            window,
            net_flow_usd: value,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uptrend() {
        let mut gen = SyntheticDataGenerator::new(42);
        let series = gen.generate(MarketScenario::Uptrend, 1000, 5);

        assert_eq!(series.prices.len(), 1000);

        let first_price = series.prices.first().unwrap().close;
        let last_price = series.prices.last().unwrap().close;
        assert!(
            last_price > first_price,
            "Uptrend should end higher: {} -> {}",
            first_price,
            last_price
        );
    }

    #[test]
    fn test_generate_downtrend() {
        let mut gen = SyntheticDataGenerator::new(42);
        let series = gen.generate(MarketScenario::Downtrend, 1000, 5);

        let first_price = series.prices.first().unwrap().close;
        let last_price = series.prices.last().unwrap().close;
        assert!(
            last_price < first_price,
            "Downtrend should end lower: {} -> {}",
            first_price,
            last_price
        );
    }

    #[test]
    fn test_generate_sideways() {
        let mut gen = SyntheticDataGenerator::new(42).with_base_price(150.0);
        let series = gen.generate(MarketScenario::Sideways, 500, 5);

        for tick in &series.prices {
            assert!(
                tick.close > 150.0 * 0.9 && tick.close < 150.0 * 1.1,
                "Sideways should stay near base: {}",
                tick.close
            );
        }
    }

    #[test]
    fn test_generate_with_gaps() {
        let mut gen = SyntheticDataGenerator::new(42);
        let series = gen.generate(MarketScenario::WithGaps, 100, 5);

        assert!(series.prices.len() < 100);

        let has_gap = series
            .prices
            .windows(2)
            .any(|w| (w[1].timestamp - w[0].timestamp).num_minutes() > 5);
        assert!(has_gap, "Should contain time gaps");
    }

    #[test]
    fn test_timestamps_are_sequential() {
        let mut gen = SyntheticDataGenerator::new(42);
        let series = gen.generate(MarketScenario::Volatile, 100, 5);

        for w in series.prices.windows(2) {
            assert!(w[1].timestamp > w[0].timestamp, "Timestamps should be sequential");
        }
    }

    #[test]
    fn test_netflow_accompanies_prices() {
        let mut gen = SyntheticDataGenerator::new(7).with_instrument("ETHUSDT");
        let series = gen.generate(MarketScenario::FlowReversals, 120, 5);

        let five: Vec<_> = series
            .netflow
            .iter()
            .filter(|t| t.window == NetflowWindow::FiveMinutes)
            .collect();
        let hourly = series
            .netflow
            .iter()
            .filter(|t| t.window == NetflowWindow::OneHour)
            .count();

        assert_eq!(five.len(), 120);
        assert_eq!(hourly, 10);
        assert!(series.netflow.iter().all(|t| t.instrument == "ETHUSDT"));
        assert_eq!(five[0].timestamp, series.prices[0].timestamp);
    }

    #[test]
    fn test_same_seed_same_series() {
        let a = SyntheticDataGenerator::new(9).generate(MarketScenario::Volatile, 50, 5);
        let b = SyntheticDataGenerator::new(9).generate(MarketScenario::Volatile, 50, 5);
        assert_eq!(a.prices, b.prices);
        assert_eq!(a.netflow, b.netflow);
    }
}
