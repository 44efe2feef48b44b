use serde::{Deserialize, Serialize};

/// Calculate Simple Moving Average (SMA) over the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Short and long moving averages at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaPair {
    pub short: f64,
    pub long: f64,
}

impl MaPair {
    /// Compute both averages from the same price window
    pub fn from_prices(prices: &[f64], short_period: usize, long_period: usize) -> Option<Self> {
        Some(Self {
            short: calculate_sma(prices, short_period)?,
            long: calculate_sma(prices, long_period)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crossover {
    /// Short MA moved above the long MA
    Bullish,
    /// Short MA moved below the long MA
    Bearish,
}

/// Compare the previous and current MA ordering
///
/// Fires only on the tick where the ordering flips; sustained separation returns `None`.
pub fn detect_crossover(previous: MaPair, current: MaPair) -> Option<Crossover> {
    if previous.short <= previous.long && current.short > current.long {
        Some(Crossover::Bullish)
    } else if previous.short >= previous.long && current.short < current.long {
        Some(Crossover::Bearish)
    } else {
        None
    }
}
