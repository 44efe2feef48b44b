use crate::indicators::Crossover;
use crate::market::{IndicatorSnapshot, NetflowConfig, NetflowReading, NetflowView};
use crate::models::{NetflowWindow, Signal, SignalSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// RSI bands for the technical sub-signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalConfig {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
        }
    }
}

/// Outcome of one evaluation, with the evidence behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalVerdict {
    pub technical: Signal,
    pub flow: Signal,
    pub combined: Signal,
    pub flow_5m: Signal,
    pub flow_1h: Signal,
    pub rsi: Option<f64>,
    pub crossover: Option<Crossover>,
}

impl SignalVerdict {
    pub fn neutral() -> Self {
        Self {
            technical: Signal::Neutral,
            flow: Signal::Neutral,
            combined: Signal::Neutral,
            flow_5m: Signal::Neutral,
            flow_1h: Signal::Neutral,
            rsi: None,
            crossover: None,
        }
    }

    pub fn by_source(&self, source: SignalSource) -> Signal {
        match source {
            SignalSource::Technical => self.technical,
            SignalSource::Flow => self.flow,
            SignalSource::Combined => self.combined,
        }
    }
}

/// Fuses price indicators and netflow into one signal
///
/// Evaluation is a pure function of its inputs and never fails: missing,
/// insufficient or stale data degrades to NEUTRAL.
#[derive(Debug, Clone, Default)]
pub struct SignalEngine {
    config: SignalConfig,
    netflow: NetflowConfig,
}

impl SignalEngine {
    pub fn new(config: SignalConfig, netflow: NetflowConfig) -> Self {
        Self { config, netflow }
    }

    pub fn netflow_config(&self) -> &NetflowConfig {
        &self.netflow
    }

    pub fn evaluate(
        &self,
        snapshot: &IndicatorSnapshot,
        netflow: &NetflowView,
        now: DateTime<Utc>,
    ) -> SignalVerdict {
        let five = netflow.reading(NetflowWindow::FiveMinutes, &self.netflow, now);
        let hour = netflow.reading(NetflowWindow::OneHour, &self.netflow, now);
        self.evaluate_readings(snapshot, &five, &hour)
    }

    pub fn evaluate_readings(
        &self,
        snapshot: &IndicatorSnapshot,
        five_minute: &NetflowReading,
        one_hour: &NetflowReading,
    ) -> SignalVerdict {
        let technical = self.technical_signal(snapshot);
        let flow_5m = self.netflow.classify(NetflowWindow::FiveMinutes, five_minute);
        let flow_1h = self.netflow.classify(NetflowWindow::OneHour, one_hour);
        let flow = flow_signal(flow_5m, flow_1h);

        let indicators = snapshot.indicators();
        SignalVerdict {
            technical,
            flow,
            combined: combine(technical, flow),
            flow_5m,
            flow_1h,
            rsi: indicators.map(|i| i.rsi),
            crossover: indicators.and_then(|i| i.crossover),
        }
    }

    /// MA crossover or RSI extreme; conflicting evidence cancels out
    pub fn technical_signal(&self, snapshot: &IndicatorSnapshot) -> Signal {
        let Some(indicators) = snapshot.indicators() else {
            return Signal::Neutral;
        };

        let bullish = indicators.crossover == Some(Crossover::Bullish)
            || indicators.rsi < self.config.rsi_oversold;
        let bearish = indicators.crossover == Some(Crossover::Bearish)
            || indicators.rsi > self.config.rsi_overbought;

        match (bullish, bearish) {
            (true, false) => Signal::Bullish,
            (false, true) => Signal::Bearish,
            _ => Signal::Neutral,
        }
    }
}

/// Either window may carry the flow signal; opposing windows cancel out
pub fn flow_signal(five_minute: Signal, one_hour: Signal) -> Signal {
    use crate::models::Signal::*;
    match (five_minute, one_hour) {
        (Bullish, Bearish) | (Bearish, Bullish) => Neutral,
        (Bullish, _) | (_, Bullish) => Bullish,
        (Bearish, _) | (_, Bearish) => Bearish,
        (Neutral, Neutral) => Neutral,
    }
}

/// Both sources must agree before a direction is taken
pub fn combine(technical: Signal, flow: Signal) -> Signal {
    match (technical, flow) {
        (Signal::Bullish, Signal::Bullish) => Signal::Bullish,
        (Signal::Bearish, Signal::Bearish) => Signal::Bearish,
        _ => Signal::Neutral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::MaPair;
    use crate::market::Indicators;
    use crate::models::NetflowTick;
    use chrono::Duration;
    use crate::models::Signal::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn ready(rsi: f64, crossover: Option<Crossover>) -> IndicatorSnapshot {
        IndicatorSnapshot::Ready(Indicators {
            as_of: now(),
            close: 100.0,
            ma: MaPair {
                short: 100.0,
                long: 100.0,
            },
            rsi,
            crossover,
        })
    }

    fn flow(five: Option<f64>, hour: Option<f64>, minutes_ago: i64) -> NetflowView {
        let tick = |window, value| NetflowTick {
            instrument: "BTCUSDT".to_string(),
            window,
            net_flow_usd: value,
            timestamp: now() - Duration::minutes(minutes_ago),
        };
        NetflowView {
            five_minute: five.map(|v| tick(NetflowWindow::FiveMinutes, v)),
            one_hour: hour.map(|v| tick(NetflowWindow::OneHour, v)),
        }
    }

    #[test]
    fn test_combined_table() {
        let cases = [
            (Bullish, Bullish, Bullish),
            (Bullish, Bearish, Neutral),
            (Bullish, Neutral, Neutral),
            (Bearish, Bullish, Neutral),
            (Bearish, Bearish, Bearish),
            (Bearish, Neutral, Neutral),
            (Neutral, Bullish, Neutral),
            (Neutral, Bearish, Neutral),
            (Neutral, Neutral, Neutral),
        ];
        for (technical, flow, expected) in cases {
            assert_eq!(
                combine(technical, flow),
                expected,
                "technical={:?} flow={:?}",
                technical,
                flow
            );
        }
    }

    #[test]
    fn test_flow_signal_table() {
        assert_eq!(flow_signal(Bullish, Neutral), Bullish);
        assert_eq!(flow_signal(Neutral, Bullish), Bullish);
        assert_eq!(flow_signal(Bullish, Bullish), Bullish);
        assert_eq!(flow_signal(Bearish, Neutral), Bearish);
        assert_eq!(flow_signal(Neutral, Bearish), Bearish);
        assert_eq!(flow_signal(Bullish, Bearish), Neutral);
        assert_eq!(flow_signal(Bearish, Bullish), Neutral);
        assert_eq!(flow_signal(Neutral, Neutral), Neutral);
    }

    #[test]
    fn test_technical_rsi_and_crossover() {
        let engine = SignalEngine::default();
        assert_eq!(engine.technical_signal(&ready(25.0, None)), Bullish);
        assert_eq!(engine.technical_signal(&ready(75.0, None)), Bearish);
        assert_eq!(engine.technical_signal(&ready(50.0, None)), Neutral);
        assert_eq!(
            engine.technical_signal(&ready(50.0, Some(Crossover::Bullish))),
            Bullish
        );
        assert_eq!(
            engine.technical_signal(&ready(50.0, Some(Crossover::Bearish))),
            Bearish
        );
        // RSI bands are strict
        assert_eq!(engine.technical_signal(&ready(30.0, None)), Neutral);
        assert_eq!(engine.technical_signal(&ready(70.0, None)), Neutral);
    }

    #[test]
    fn test_technical_conflict_cancels() {
        let engine = SignalEngine::default();
        assert_eq!(
            engine.technical_signal(&ready(80.0, Some(Crossover::Bullish))),
            Neutral
        );
        assert_eq!(
            engine.technical_signal(&ready(20.0, Some(Crossover::Bearish))),
            Neutral
        );
        // agreeing evidence stays directional
        assert_eq!(
            engine.technical_signal(&ready(20.0, Some(Crossover::Bullish))),
            Bullish
        );
    }

    #[test]
    fn test_bullish_requires_both_sources() {
        let engine = SignalEngine::default();
        let verdict = engine.evaluate(&ready(25.0, None), &flow(Some(-2e6), None, 0), now());
        assert_eq!(verdict.technical, Bullish);
        assert_eq!(verdict.flow, Bullish);
        assert_eq!(verdict.combined, Bullish);
        assert_eq!(verdict.rsi, Some(25.0));

        let verdict = engine.evaluate(&ready(50.0, None), &flow(Some(-2e6), None, 0), now());
        assert_eq!(verdict.combined, Neutral);
    }

    #[test]
    fn test_bearish_from_one_hour_window() {
        let engine = SignalEngine::default();
        let verdict = engine.evaluate(
            &ready(50.0, Some(Crossover::Bearish)),
            &flow(Some(0.0), Some(6e6), 0),
            now(),
        );
        assert_eq!(verdict.flow_5m, Neutral);
        assert_eq!(verdict.flow_1h, Bearish);
        assert_eq!(verdict.combined, Bearish);
    }

    #[test]
    fn test_insufficient_indicators_force_neutral() {
        let engine = SignalEngine::default();
        let snapshot = IndicatorSnapshot::Insufficient {
            samples: 10,
            required: 25,
        };
        let verdict = engine.evaluate(&snapshot, &flow(Some(-9e6), Some(-9e6), 0), now());
        assert_eq!(verdict.flow, Bullish);
        assert_eq!(verdict.technical, Neutral);
        assert_eq!(verdict.combined, Neutral);
        assert_eq!(verdict.rsi, None);
    }

    #[test]
    fn test_stale_netflow_forces_neutral() {
        let engine = SignalEngine::default();
        let verdict = engine.evaluate(&ready(10.0, None), &flow(Some(-9e6), Some(-9e6), 30), now());
        assert_eq!(verdict.technical, Bullish);
        assert_eq!(verdict.flow_5m, Neutral);
        assert_eq!(verdict.flow_1h, Neutral);
        assert_eq!(verdict.combined, Neutral);
    }

    #[test]
    fn test_absent_netflow_forces_neutral() {
        let engine = SignalEngine::default();
        let verdict = engine.evaluate(&ready(10.0, None), &NetflowView::default(), now());
        assert_eq!(verdict.combined, Neutral);
    }

    #[test]
    fn test_threshold_netflow_is_neutral() {
        let engine = SignalEngine::default();
        let verdict = engine.evaluate(&ready(10.0, None), &flow(Some(-1e6), None, 0), now());
        assert_eq!(verdict.flow_5m, Neutral);
        assert_eq!(verdict.combined, Neutral);
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let engine = SignalEngine::default();
        let snapshot = ready(28.0, Some(Crossover::Bullish));
        let view = flow(Some(-3e6), Some(1e6), 2);
        assert_eq!(
            engine.evaluate(&snapshot, &view, now()),
            engine.evaluate(&snapshot, &view, now())
        );
    }

    #[test]
    fn test_by_source() {
        let verdict = SignalVerdict {
            technical: Bullish,
            flow: Bearish,
            ..SignalVerdict::neutral()
        };
        assert_eq!(verdict.by_source(SignalSource::Technical), Bullish);
        assert_eq!(verdict.by_source(SignalSource::Flow), Bearish);
        assert_eq!(verdict.by_source(SignalSource::Combined), Neutral);
    }
}
