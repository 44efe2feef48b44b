// Order execution and position lifecycle
pub mod gateway;
pub mod lifecycle;
pub mod paper;

pub use gateway::{with_timeout, GatewayError, OrderGateway};
pub use lifecycle::{
    LifecycleEvent, LifecycleSettings, Mismatch, OpenPosition, PositionLifecycle, PositionState,
};
pub use paper::{PaperGateway, PaperOp, PaperStats};
