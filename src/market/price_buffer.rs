use crate::indicators::{calculate_rsi, detect_crossover, Crossover, MaPair};
use crate::models::PriceTick;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BufferError {
    #[error("tick at {tick} is not newer than last recorded tick at {last}")]
    OutOfOrder {
        tick: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    #[error("tick for {got} recorded into buffer for {expected}")]
    WrongInstrument { expected: String, got: String },
}

/// Indicator periods
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndicatorConfig {
    pub short_ma_period: usize,
    pub long_ma_period: usize,
    pub rsi_period: usize,
    /// Ticks kept per instrument (RSI smoothing runs over this window)
    pub capacity: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            short_ma_period: 7,
            long_ma_period: 25,
            rsi_period: 14,
            capacity: 500,
        }
    }
}

impl IndicatorConfig {
    /// Ticks needed before every indicator is defined
    pub fn required_samples(&self) -> usize {
        self.long_ma_period
            .max(self.short_ma_period)
            .max(self.rsi_period + 1)
    }
}

/// Indicators derived at the latest tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    pub as_of: DateTime<Utc>,
    pub close: f64,
    pub ma: MaPair,
    pub rsi: f64,
    /// Set only on the tick where the MA ordering flipped
    pub crossover: Option<Crossover>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndicatorSnapshot {
    Insufficient { samples: usize, required: usize },
    Ready(Indicators),
}

impl IndicatorSnapshot {
    pub fn indicators(&self) -> Option<&Indicators> {
        match self {
            IndicatorSnapshot::Ready(indicators) => Some(indicators),
            IndicatorSnapshot::Insufficient { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.indicators().is_some()
    }
}

/// Rolling window of closes for one instrument
///
/// Owned by the price producer; readers get [`IndicatorSnapshot`] values.
#[derive(Debug, Clone)]
pub struct PriceSeriesBuffer {
    instrument: String,
    ticks: VecDeque<PriceTick>,
    config: IndicatorConfig,
    /// MA pair as of the tick before the latest one
    previous_ma: Option<MaPair>,
}

impl PriceSeriesBuffer {
    pub fn new(instrument: impl Into<String>, config: IndicatorConfig) -> Self {
        let mut config = config;
        config.capacity = config.capacity.max(config.required_samples() + 1);

        Self {
            instrument: instrument.into(),
            ticks: VecDeque::with_capacity(config.capacity),
            config,
            previous_ma: None,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.ticks.back().map(|t| t.timestamp)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.ticks.back().map(|t| t.close)
    }

    /// Append a tick; ticks must arrive in strictly increasing time order
    pub fn record(&mut self, tick: PriceTick) -> Result<(), BufferError> {
        if tick.instrument != self.instrument {
            return Err(BufferError::WrongInstrument {
                expected: self.instrument.clone(),
                got: tick.instrument,
            });
        }
        if let Some(last) = self.last_timestamp() {
            if tick.timestamp <= last {
                return Err(BufferError::OutOfOrder {
                    tick: tick.timestamp,
                    last,
                });
            }
        }

        self.previous_ma = self.current_ma();
        self.ticks.push_back(tick);

        while self.ticks.len() > self.config.capacity {
            self.ticks.pop_front();
        }

        Ok(())
    }

    /// Record a batch, skipping ticks that are not newer than what we hold
    ///
    /// Returns the number of ticks appended.
    pub fn record_new(&mut self, ticks: impl IntoIterator<Item = PriceTick>) -> usize {
        let mut appended = 0;
        for tick in ticks {
            match self.record(tick) {
                Ok(()) => appended += 1,
                Err(e) => tracing::debug!("Skipping price tick: {}", e),
            }
        }
        appended
    }

    pub fn snapshot(&self) -> IndicatorSnapshot {
        let required = self.config.required_samples();
        if self.ticks.len() < required {
            return IndicatorSnapshot::Insufficient {
                samples: self.ticks.len(),
                required,
            };
        }

        let closes = self.closes();
        let (Some(ma), Some(rsi), Some(last)) = (
            MaPair::from_prices(
                &closes,
                self.config.short_ma_period,
                self.config.long_ma_period,
            ),
            calculate_rsi(&closes, self.config.rsi_period),
            self.ticks.back(),
        ) else {
            return IndicatorSnapshot::Insufficient {
                samples: self.ticks.len(),
                required,
            };
        };

        IndicatorSnapshot::Ready(Indicators {
            as_of: last.timestamp,
            close: last.close,
            ma,
            rsi,
            crossover: self.previous_ma.and_then(|prev| detect_crossover(prev, ma)),
        })
    }

    fn closes(&self) -> Vec<f64> {
        self.ticks.iter().map(|t| t.close).collect()
    }

    fn current_ma(&self) -> Option<MaPair> {
        MaPair::from_prices(
            &self.closes(),
            self.config.short_ma_period,
            self.config.long_ma_period,
        )
    }
}
