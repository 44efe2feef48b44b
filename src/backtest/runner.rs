use crate::backtest::metrics::BacktestMetrics;
use crate::execution::{LifecycleEvent, LifecycleSettings, PaperGateway, PositionLifecycle, PositionState};
use crate::market::{IndicatorConfig, NetflowAggregator, NetflowConfig, PriceSeriesBuffer};
use crate::models::{NetflowTick, PriceTick, Trade};
use crate::persistence::MemoryPositionStore;
use crate::risk::RiskProfile;
use crate::strategy::{SignalConfig, SignalEngine};
use crate::Result;
use std::sync::Arc;

/// Everything a replay needs besides the data
#[derive(Debug, Clone)]
pub struct BacktestSettings {
    pub instrument: String,
    pub indicators: IndicatorConfig,
    pub signal: SignalConfig,
    pub netflow: NetflowConfig,
    pub risk: RiskProfile,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            instrument: "BTCUSDT".to_string(),
            indicators: IndicatorConfig::default(),
            signal: SignalConfig::default(),
            netflow: NetflowConfig::default(),
            risk: RiskProfile::default(),
        }
    }
}

/// Replays history through the live signal and lifecycle code
///
/// A paper gateway pinned to each tick's timestamp stands in for the broker,
/// so fills, exits and timeouts happen in simulated time.
pub struct BacktestRunner {
    settings: BacktestSettings,
}

impl BacktestRunner {
    pub fn new(settings: BacktestSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BacktestSettings {
        &self.settings
    }

    /// Run a backtest over price ticks and the netflow observed alongside them
    ///
    /// Per tick: exits are checked first at the new close, then the fused signal
    /// is evaluated and acted on. A position still open at the end is closed
    /// manually at the final close.
    pub async fn run(&self, prices: Vec<PriceTick>, netflow: Vec<NetflowTick>) -> Result<BacktestMetrics> {
        let instrument = self.settings.instrument.clone();
        let samples_needed = self.settings.indicators.required_samples();

        if prices.len() <= samples_needed {
            return Err(format!(
                "Not enough price ticks for backtest. Need more than {}, got {}",
                samples_needed,
                prices.len()
            )
            .into());
        }

        tracing::info!(
            "Starting backtest: {} price ticks, {} netflow ticks, indicators need {}",
            prices.len(),
            netflow.len(),
            samples_needed
        );

        let gateway = Arc::new(PaperGateway::new());
        let mut lifecycle = PositionLifecycle::new(
            instrument.clone(),
            self.settings.risk.clone(),
            LifecycleSettings::default(),
            gateway.clone(),
            Arc::new(MemoryPositionStore::new()),
        );
        let engine = SignalEngine::new(self.settings.signal.clone(), self.settings.netflow.clone());
        let mut buffer = PriceSeriesBuffer::new(instrument.clone(), self.settings.indicators.clone());
        let mut aggregator = NetflowAggregator::new(self.settings.netflow.clone());

        let mut netflow = netflow;
        netflow.sort_by_key(|t| t.timestamp);
        let mut pending_flow = netflow.into_iter().peekable();

        let mut trades: Vec<Trade> = Vec::new();
        let mut directional_signals = 0;
        let mut skipped_ticks = 0;
        let mut last_tick: Option<PriceTick> = None;

        for tick in prices {
            if let Err(e) = buffer.record(tick.clone()) {
                skipped_ticks += 1;
                tracing::debug!("Skipping price tick: {}", e);
                continue;
            }
            let now = tick.timestamp;

            gateway.set_clock(Some(now));
            gateway.mark_price(&instrument, tick.close);

            while let Some(flow) = pending_flow.next_if(|f| f.timestamp <= now) {
                if flow.instrument == instrument {
                    aggregator.update(flow);
                }
            }

            // Check for exit conditions on the open position FIRST
            if let Some(LifecycleEvent::Closed(trade)) = lifecycle.monitor_at(now).await {
                trades.push(trade);
            }

            let verdict = engine.evaluate(&buffer.snapshot(), &aggregator.view(&instrument), now);
            if verdict.combined.side().is_some() {
                directional_signals += 1;
            }
            if let Some(LifecycleEvent::Opened(position)) = lifecycle.on_signal(verdict.combined).await {
                tracing::debug!(
                    "Opened {} @ ${:.2} at {}",
                    position.side,
                    position.entry_price,
                    now
                );
            }

            last_tick = Some(tick);
        }

        // Close any remaining open position at the final price
        let still_open = matches!(lifecycle.state(), PositionState::Open(_));
        if let (true, Some(tick)) = (still_open, &last_tick) {
            if let LifecycleEvent::Closed(trade) = lifecycle.close_manual(tick.timestamp).await? {
                trades.push(trade);
            }
        }

        if skipped_ticks > 0 {
            tracing::warn!("Skipped {} out-of-order or foreign price ticks", skipped_ticks);
        }

        let metrics = BacktestMetrics::from_trades(trades, directional_signals);

        tracing::info!(
            "Backtest complete: {} trades, return {:+.2}%, win rate {:.1}%",
            metrics.total_trades,
            metrics.total_return_pct,
            metrics.win_rate
        );

        Ok(metrics)
    }

    /// Run backtest and print report
    pub async fn run_and_report(
        &self,
        prices: Vec<PriceTick>,
        netflow: Vec<NetflowTick>,
        scenario_name: &str,
    ) -> Result<BacktestMetrics> {
        println!("\n🔬 Running backtest: {}", scenario_name);
        println!("   Instrument: {}", self.settings.instrument);
        println!("   Price ticks: {}", prices.len());
        println!(
            "   Risk: TP {:+.1}% / SL {:+.1}% / {}s / {}x",
            self.settings.risk.take_profit_pct,
            self.settings.risk.stop_loss_pct,
            self.settings.risk.max_duration_secs,
            self.settings.risk.leverage
        );

        let metrics = self.run(prices, netflow).await?;
        metrics.print_report();

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::synthetic::{MarketScenario, SyntheticDataGenerator};
    use crate::models::{ExitReason, NetflowWindow, Side};
    use chrono::{DateTime, Duration, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn ticks(closes: &[f64]) -> Vec<PriceTick> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| PriceTick::new("BTCUSDT", t0() + Duration::minutes(5 * i as i64), *c))
            .collect()
    }

    fn outflow_at(i: usize) -> NetflowTick {
        NetflowTick {
            instrument: "BTCUSDT".to_string(),
            window: NetflowWindow::FiveMinutes,
            net_flow_usd: -3_000_000.0,
            timestamp: t0() + Duration::minutes(5 * i as i64),
        }
    }

    /// 40 falling closes, then a rally; MA7 crosses over MA25 at index 44 (close 186)
    ///
    /// RSI is oversold at index 40, so outflow is only published at the crossover.
    fn falling_then_rally() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..40).map(|i| 200.0 - i as f64).collect();
        closes.extend((1..=30).map(|i| 161.0 + 5.0 * i as f64));
        closes
    }

    #[tokio::test]
    async fn test_crossover_with_outflow_takes_profit() {
        let closes = falling_then_rally();

        let runner = BacktestRunner::new(BacktestSettings::default());
        let metrics = runner.run(ticks(&closes), vec![outflow_at(44)]).await.unwrap();

        assert_eq!(metrics.total_trades, 1);
        let trade = &metrics.trades[0];
        assert_eq!(trade.position.side, Side::Long);
        assert_eq!(trade.position.entry_price, 186.0);
        // 196 is the first close at or above +5%
        assert_eq!(trade.exit_price, 196.0);
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(metrics.win_rate, 100.0);
    }

    #[tokio::test]
    async fn test_no_flow_no_trades() {
        let runner = BacktestRunner::new(BacktestSettings::default());
        let metrics = runner.run(ticks(&falling_then_rally()), vec![]).await.unwrap();

        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.directional_signals, 0);
    }

    #[tokio::test]
    async fn test_open_position_closed_at_end() {
        // Rally stalls after index 49, well inside the holding limit
        let mut closes = falling_then_rally();
        closes.truncate(50);
        let last = *closes.last().unwrap();
        closes.extend(std::iter::repeat(last).take(3));

        let risk = RiskProfile {
            take_profit_pct: 50.0,
            ..RiskProfile::default()
        };
        let runner = BacktestRunner::new(BacktestSettings {
            risk,
            ..BacktestSettings::default()
        });

        let metrics = runner.run(ticks(&closes), vec![outflow_at(44)]).await.unwrap();

        assert_eq!(metrics.total_trades, 1);
        assert_eq!(metrics.exit_count(ExitReason::Manual), 1);
        assert_eq!(metrics.trades[0].exit_price, 211.0);
    }

    #[tokio::test]
    async fn test_timeout_exit_in_simulated_time() {
        let closes = falling_then_rally();
        let risk = RiskProfile {
            take_profit_pct: 500.0,
            stop_loss_pct: -500.0,
            max_duration_secs: 15 * 60,
            ..RiskProfile::default()
        };
        let runner = BacktestRunner::new(BacktestSettings {
            risk,
            ..BacktestSettings::default()
        });

        let metrics = runner.run(ticks(&closes), vec![outflow_at(44)]).await.unwrap();

        assert_eq!(metrics.total_trades, 1);
        assert_eq!(metrics.trades[0].exit_reason, ExitReason::Timeout);
        assert_eq!(metrics.trades[0].holding_minutes(), 15);
    }

    #[tokio::test]
    async fn test_backtest_insufficient_data() {
        let runner = BacktestRunner::new(BacktestSettings::default());
        let result = runner.run(ticks(&[100.0; 10]), vec![]).await;

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Not enough price ticks"));
    }

    #[tokio::test]
    async fn test_synthetic_scenarios_run() {
        for scenario in MarketScenario::ALL {
            let series = SyntheticDataGenerator::new(42).generate(scenario, 400, 5);
            let runner = BacktestRunner::new(BacktestSettings::default());
            let metrics = runner.run(series.prices, series.netflow).await.unwrap();

            // At most one position at a time: trades never overlap
            for pair in metrics.trades.windows(2) {
                assert!(pair[1].position.entry_time >= pair[0].exit_time);
            }
            assert_eq!(
                metrics.exit_reasons.values().sum::<usize>(),
                metrics.total_trades
            );
        }
    }
}
