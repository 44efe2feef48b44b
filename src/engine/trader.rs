use super::display::{DisplayFrame, SignalHistory};
use crate::execution::{LifecycleEvent, PositionLifecycle, PositionState};
use crate::market::{IndicatorSnapshot, NetflowView};
use crate::models::NetflowWindow;
use crate::strategy::{SignalEngine, SignalVerdict};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval_at, Duration, Instant};

#[derive(Debug, Clone)]
pub struct TraderSettings {
    pub signal_interval: Duration,
    pub monitor_interval: Duration,
    /// Delay before the first signal evaluation
    pub signal_delay: Duration,
    pub history_len: usize,
}

impl Default for TraderSettings {
    fn default() -> Self {
        Self {
            signal_interval: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(10),
            signal_delay: Duration::from_secs(30),
            history_len: 20,
        }
    }
}

/// Per-instrument task: evaluates signals and monitors the open position
///
/// Owns the instrument's `PositionLifecycle`; nothing else mutates it.
pub struct Trader {
    lifecycle: PositionLifecycle,
    engine: SignalEngine,
    indicators: watch::Receiver<IndicatorSnapshot>,
    netflow: watch::Receiver<NetflowView>,
    display: watch::Sender<DisplayFrame>,
    history: SignalHistory,
    verdict: SignalVerdict,
    last_return: Option<f64>,
    settings: TraderSettings,
}

impl Trader {
    pub fn new(
        lifecycle: PositionLifecycle,
        engine: SignalEngine,
        indicators: watch::Receiver<IndicatorSnapshot>,
        netflow: watch::Receiver<NetflowView>,
        settings: TraderSettings,
    ) -> (Self, watch::Receiver<DisplayFrame>) {
        let (display, frames) = watch::channel(DisplayFrame::empty(lifecycle.instrument()));
        let trader = Self {
            lifecycle,
            engine,
            indicators,
            netflow,
            display,
            history: SignalHistory::new(settings.history_len),
            verdict: SignalVerdict::neutral(),
            last_return: None,
            settings,
        };
        (trader, frames)
    }

    pub fn lifecycle(&self) -> &PositionLifecycle {
        &self.lifecycle
    }

    pub fn verdict(&self) -> &SignalVerdict {
        &self.verdict
    }

    /// Evaluate the latest snapshots and act on the combined signal
    ///
    /// The verdict is refreshed every cycle, but the lifecycle only sees it when a
    /// producer published new data since the previous evaluation, so one crossover
    /// never opens twice.
    pub async fn signal_cycle_at(&mut self, now: DateTime<Utc>) -> Option<LifecycleEvent> {
        let fresh_inputs = self.indicators.has_changed().unwrap_or(false)
            || self.netflow.has_changed().unwrap_or(false);
        let snapshot = self.indicators.borrow_and_update().clone();
        let view = self.netflow.borrow_and_update().clone();

        self.verdict = self.engine.evaluate(&snapshot, &view, now);
        self.history.push(now, &self.verdict);

        tracing::info!(
            instrument = %self.lifecycle.instrument(),
            "💹 [SIGNAL] technical {} / flow {} (5m {}, 1h {}) -> {}",
            self.verdict.technical,
            self.verdict.flow,
            self.verdict.flow_5m,
            self.verdict.flow_1h,
            self.verdict.combined
        );

        let event = if fresh_inputs {
            self.lifecycle.on_signal(self.verdict.combined).await
        } else {
            tracing::debug!(
                instrument = %self.lifecycle.instrument(),
                "No new market data since last evaluation"
            );
            None
        };

        if let Some(LifecycleEvent::Opened(_)) = event {
            self.last_return = Some(0.0);
        }
        self.publish(now, &snapshot, &view);
        event
    }

    pub async fn monitor_cycle_at(&mut self, now: DateTime<Utc>) -> Option<LifecycleEvent> {
        let event = self.lifecycle.monitor_at(now).await;

        match &event {
            Some(LifecycleEvent::Holding { return_pct }) => {
                if return_pct.is_some() {
                    self.last_return = *return_pct;
                }
            }
            Some(LifecycleEvent::Closed(_)) => self.last_return = None,
            _ => {}
        }

        let snapshot = self.indicators.borrow().clone();
        let view = self.netflow.borrow().clone();
        self.publish(now, &snapshot, &view);
        event
    }

    fn publish(&self, now: DateTime<Utc>, snapshot: &IndicatorSnapshot, view: &NetflowView) {
        let netflow_config = self.engine.netflow_config();
        let state = self.lifecycle.state();
        let halted_reason = match state {
            PositionState::Halted(mismatch) => Some(mismatch.to_string()),
            _ => None,
        };

        self.display.send_replace(DisplayFrame {
            instrument: self.lifecycle.instrument().to_string(),
            at: now,
            indicators: snapshot.clone(),
            flow_5m: view.reading(NetflowWindow::FiveMinutes, netflow_config, now),
            flow_1h: view.reading(NetflowWindow::OneHour, netflow_config, now),
            verdict: self.verdict.clone(),
            state: state.label(),
            position: state.position().cloned(),
            unrealized_return_pct: state.position().and(self.last_return),
            halted_reason,
            last_trade: self.lifecycle.last_trade().cloned(),
            recent_trades: self.lifecycle.recent_trades().to_vec(),
            history: self.history.records(),
        });
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let instrument = self.lifecycle.instrument().to_string();
        tracing::info!(
            "🤖 Trader for {} starting (signals every {:?}, monitor every {:?})",
            instrument,
            self.settings.signal_interval,
            self.settings.monitor_interval
        );

        let mut signal_ticker = interval_at(
            Instant::now() + self.settings.signal_delay,
            self.settings.signal_interval,
        );
        signal_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut monitor_ticker = interval_at(Instant::now(), self.settings.monitor_interval);
        monitor_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = signal_ticker.tick() => {
                    self.signal_cycle_at(Utc::now()).await;
                }
                _ = monitor_ticker.tick() => {
                    self.monitor_cycle_at(Utc::now()).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        match self.lifecycle.state() {
            PositionState::Open(open) => tracing::warn!(
                "Trader for {} stopped with OPEN {} position @ ${:.2}; it will be reconciled on restart",
                instrument,
                open.position.side,
                open.position.entry_price
            ),
            state => tracing::info!("Trader for {} stopped ({})", instrument, state.label()),
        }
    }
}
