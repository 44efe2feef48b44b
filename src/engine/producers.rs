use crate::api::{NetflowSource, PriceSource};
use crate::execution::PaperGateway;
use crate::market::{IndicatorConfig, IndicatorSnapshot, NetflowAggregator, NetflowConfig, NetflowView, PriceSeriesBuffer};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Duration, Instant};

/// Closes requested per poll once the buffer is warm
const INCREMENTAL_LIMIT: usize = 12;

/// Polls a price source into the instrument's buffer and publishes snapshots
///
/// The buffer is owned here; consumers only see immutable snapshots.
pub struct PriceProducer {
    instrument: String,
    source: Arc<dyn PriceSource>,
    buffer: PriceSeriesBuffer,
    poll: Duration,
    backfill: usize,
    marks: Option<Arc<PaperGateway>>,
    tx: watch::Sender<IndicatorSnapshot>,
}

impl PriceProducer {
    pub fn new(
        instrument: impl Into<String>,
        source: Arc<dyn PriceSource>,
        config: IndicatorConfig,
        poll: Duration,
    ) -> (Self, watch::Receiver<IndicatorSnapshot>) {
        let instrument = instrument.into();
        let backfill = config.capacity.max(config.required_samples() + 1);
        let buffer = PriceSeriesBuffer::new(instrument.clone(), config);
        let (tx, rx) = watch::channel(buffer.snapshot());

        (
            Self {
                instrument,
                source,
                buffer,
                poll,
                backfill,
                marks: None,
                tx,
            },
            rx,
        )
    }

    /// Mark every new close on a paper gateway so simulated fills track the market
    pub fn with_marks(mut self, paper: Arc<PaperGateway>) -> Self {
        self.marks = Some(paper);
        self
    }

    /// Fetch once; publishes a snapshot only when new ticks arrived
    pub async fn poll_once(&mut self) -> crate::Result<usize> {
        let limit = if self.buffer.is_empty() {
            self.backfill
        } else {
            INCREMENTAL_LIMIT
        };
        let ticks = self.source.recent_closes(&self.instrument, limit).await?;
        let appended = self.buffer.record_new(ticks);

        if appended > 0 {
            if let (Some(paper), Some(close)) = (&self.marks, self.buffer.last_close()) {
                paper.mark_price(&self.instrument, close);
            }

            let snapshot = self.buffer.snapshot();
            tracing::debug!(
                instrument = %self.instrument,
                "Recorded {} new closes ({} buffered), ready: {}",
                appended,
                self.buffer.len(),
                snapshot.is_ready()
            );
            self.tx.send_replace(snapshot);
        }

        Ok(appended)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("🔄 Price producer for {} starting (every {:?})", self.instrument, self.poll);

        let mut ticker = interval_at(Instant::now(), self.poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!("  ✗ {} price fetch failed: {}", self.instrument, e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Price producer for {} stopped", self.instrument);
    }
}

/// Polls a netflow source and publishes the instrument's latest 5m/1h view
pub struct NetflowProducer {
    instrument: String,
    source: Arc<dyn NetflowSource>,
    aggregator: NetflowAggregator,
    poll: Duration,
    tx: watch::Sender<NetflowView>,
}

impl NetflowProducer {
    pub fn new(
        instrument: impl Into<String>,
        source: Arc<dyn NetflowSource>,
        config: NetflowConfig,
        poll: Duration,
    ) -> (Self, watch::Receiver<NetflowView>) {
        let (tx, rx) = watch::channel(NetflowView::default());
        (
            Self {
                instrument: instrument.into(),
                source,
                aggregator: NetflowAggregator::new(config),
                poll,
                tx,
            },
            rx,
        )
    }

    /// Fetch once; publishes only when a window got a newer tick
    pub async fn poll_once(&mut self) -> crate::Result<usize> {
        let ticks = self.source.latest(&self.instrument).await?;

        let mut updated = 0;
        for tick in ticks {
            if tick.instrument != self.instrument {
                continue;
            }
            if self.aggregator.update(tick) {
                updated += 1;
            }
        }

        if updated > 0 {
            self.tx.send_replace(self.aggregator.view(&self.instrument));
        }
        Ok(updated)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("🌊 Netflow producer for {} starting (every {:?})", self.instrument, self.poll);

        let mut ticker = interval_at(Instant::now(), self.poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        // Readings age into stale; never substitute zero flow
                        tracing::warn!("  ✗ {} netflow fetch failed: {}", self.instrument, e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Netflow producer for {} stopped", self.instrument);
    }
}
