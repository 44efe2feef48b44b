// Technical indicators module
// Implements SMA, MA crossover and Wilder RSI

pub mod moving_average;
pub mod rsi;

pub use moving_average::{calculate_sma, detect_crossover, Crossover, MaPair};
pub use rsi::calculate_rsi;
