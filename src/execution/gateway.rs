use crate::models::{Fill, Position, Side};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// No answer within the call deadline; the order may or may not have executed
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no open position for {0}")]
    NoPosition(String),
    #[error("failed to decode gateway response: {0}")]
    Decode(String),
    /// The broker accepted the order but did not report it filled
    #[error("order outcome unknown: {0}")]
    Unconfirmed(String),
}

impl GatewayError {
    /// Only a refusal guarantees that no order executed
    pub fn is_definite_rejection(&self) -> bool {
        matches!(self, GatewayError::Rejected(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// Broker boundary: the only way positions are opened or closed
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn open_position(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        leverage: u32,
    ) -> Result<Fill, GatewayError>;

    /// Close the whole open position for `instrument`
    async fn close_position(&self, instrument: &str) -> Result<Fill, GatewayError>;

    async fn current_price(&self, instrument: &str) -> Result<f64, GatewayError>;

    /// Ground truth for reconciliation
    async fn current_position(&self, instrument: &str) -> Result<Option<Position>, GatewayError>;

    /// Quote-asset balance free for new margin, for balance-based sizing
    async fn available_balance(&self) -> Result<f64, GatewayError>;

    fn name(&self) -> &str;
}

/// Bound a gateway call; an elapsed deadline becomes `GatewayError::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}
