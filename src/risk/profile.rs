use crate::models::{ExitReason, Position};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Error, PartialEq)]
pub enum RiskError {
    #[error("profile {profile}: take_profit_pct must be positive, got {value}")]
    TakeProfit { profile: String, value: f64 },
    #[error("profile {profile}: stop_loss_pct must be negative, got {value}")]
    StopLoss { profile: String, value: f64 },
    #[error("profile {profile}: max_duration_secs must be positive")]
    MaxDuration { profile: String },
    #[error("profile {profile}: leverage must be at least 1")]
    Leverage { profile: String },
    #[error("profile {profile}: size must be positive, got {value}")]
    Size { profile: String, value: f64 },
    #[error("profile {profile}: balance_pct must be in (0, 100], got {value}")]
    BalancePct { profile: String, value: f64 },
    #[error("unknown risk profile {0}")]
    UnknownProfile(String),
}

/// Fixed exit rules and order sizing for an instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskProfile {
    /// Leveraged return (percent) that closes with take_profit
    pub take_profit_pct: f64,
    /// Leveraged return (percent, negative) that closes with stop_loss
    pub stop_loss_pct: f64,
    /// Holding time after which the position is closed with timeout
    pub max_duration_secs: u64,
    pub leverage: u32,
    /// Order quantity in base asset
    pub size: f64,
    /// Percent of the available balance committed as margin; replaces `size` when set
    pub balance_pct: Option<f64>,
}

impl Default for RiskProfile {
    fn default() -> Self {
        Self {
            take_profit_pct: 5.0,
            stop_loss_pct: -10.0,
            max_duration_secs: 3600,
            leverage: 1,
            size: 0.001,
            balance_pct: None,
        }
    }
}

impl RiskProfile {
    pub fn max_duration(&self) -> Duration {
        Duration::seconds(self.max_duration_secs as i64)
    }

    pub fn validate(&self, name: &str) -> Result<(), RiskError> {
        let profile = name.to_string();
        if !(self.take_profit_pct > 0.0) {
            return Err(RiskError::TakeProfit {
                profile,
                value: self.take_profit_pct,
            });
        }
        if !(self.stop_loss_pct < 0.0) {
            return Err(RiskError::StopLoss {
                profile,
                value: self.stop_loss_pct,
            });
        }
        if self.max_duration_secs == 0 {
            return Err(RiskError::MaxDuration { profile });
        }
        if self.leverage < 1 {
            return Err(RiskError::Leverage { profile });
        }
        if !(self.size > 0.0) {
            return Err(RiskError::Size {
                profile,
                value: self.size,
            });
        }
        if let Some(pct) = self.balance_pct {
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(RiskError::BalancePct {
                    profile: name.to_string(),
                    value: pct,
                });
            }
        }
        Ok(())
    }

    /// Base quantity for `balance_pct` of `balance` as margin at `price`
    ///
    /// `None` without a percentage, or when the result is not a positive size.
    pub fn balance_size(&self, balance: f64, price: f64) -> Option<f64> {
        let pct = self.balance_pct?;
        let size = balance * pct / 100.0 * self.leverage as f64 / price;
        (size.is_finite() && size > 0.0).then_some(size)
    }

    /// Decide whether an open position must close
    ///
    /// Checked in priority order: take profit, stop loss, timeout. Without a
    /// price only the timeout rule can fire.
    pub fn exit_reason(
        &self,
        position: &Position,
        current_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        if let Some(price) = current_price {
            let ret = position.unrealized_return_pct(price);
            if ret >= self.take_profit_pct {
                return Some(ExitReason::TakeProfit);
            }
            if ret <= self.stop_loss_pct {
                return Some(ExitReason::StopLoss);
            }
        }

        if now - position.entry_time >= self.max_duration() {
            return Some(ExitReason::Timeout);
        }

        None
    }
}

/// Named risk profiles; `default` always resolves
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RiskProfiles(HashMap<String, RiskProfile>);

impl Default for RiskProfiles {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), RiskProfile::default());
        Self(profiles)
    }
}

impl RiskProfiles {
    pub fn insert(&mut self, name: impl Into<String>, profile: RiskProfile) {
        self.0.insert(name.into(), profile);
    }

    pub fn get(&self, name: &str) -> Result<&RiskProfile, RiskError> {
        self.0
            .get(name)
            .ok_or_else(|| RiskError::UnknownProfile(name.to_string()))
    }

    /// Fill in the default profile if the config did not name one
    pub fn with_default(mut self) -> Self {
        self.0
            .entry(DEFAULT_PROFILE.to_string())
            .or_insert_with(RiskProfile::default);
        self
    }

    pub fn validate(&self) -> Result<(), RiskError> {
        for (name, profile) in &self.0 {
            profile.validate(name)?;
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}
