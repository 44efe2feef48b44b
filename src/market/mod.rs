// Market data state: rolling prices and latest netflow
pub mod netflow;
pub mod price_buffer;

pub use netflow::{NetflowAggregator, NetflowConfig, NetflowReading, NetflowView, WindowConfig};
pub use price_buffer::{BufferError, IndicatorConfig, IndicatorSnapshot, Indicators, PriceSeriesBuffer};
