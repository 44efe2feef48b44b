// Signal fusion
pub mod signals;

pub use signals::{combine, flow_signal, SignalConfig, SignalEngine, SignalVerdict};
