use crate::api::netflow_csv::CrawlerClock;
use crate::engine::Schedule;
use crate::execution::LifecycleSettings;
use crate::market::{IndicatorConfig, NetflowConfig};
use crate::models::NetflowWindow;
use crate::risk::{RiskError, RiskProfile, RiskProfiles, DEFAULT_PROFILE};
use crate::strategy::SignalConfig;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "flowbot.toml";
pub const ENV_PREFIX: &str = "FLOWBOT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error("no instruments configured")]
    NoInstruments,
    #[error("duplicate instrument {0}")]
    DuplicateInstrument(String),
    #[error("instrument {symbol} uses unknown risk profile {profile}")]
    UnknownProfile { symbol: String, profile: String },
    #[error("instrument {0} has no netflow_csv")]
    NoNetflowSource(String),
    #[error("instruments {first} and {second} share netflow source {path}")]
    SharedNetflowSource {
        first: String,
        second: String,
        path: PathBuf,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentConfig {
    pub symbol: String,
    #[serde(default = "default_profile_name")]
    pub risk_profile: String,
    /// Crawler CSV carrying this instrument's exchange netflow
    pub netflow_csv: Option<PathBuf>,
}

fn default_profile_name() -> String {
    DEFAULT_PROFILE.to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    Paper,
    Binance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub mode: GatewayMode,
    /// Overrides the testnet/mainnet URL
    pub base_url: Option<String>,
    pub testnet: bool,
    pub timeout_secs: u64,
    pub recv_window_ms: u64,
    /// Quote balance the paper broker reports for balance-based sizing
    pub paper_balance: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::Paper,
            base_url: None,
            testnet: true,
            timeout_secs: 10,
            recv_window_ms: 5000,
            paper_balance: 10_000.0,
        }
    }
}

impl GatewayConfig {
    pub fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.clone(),
            None if self.testnet => crate::api::binance::TESTNET_BASE_URL.to_string(),
            None => crate::api::binance::MAINNET_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleSection {
    pub max_close_attempts: u32,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            max_close_attempts: LifecycleSettings::default().max_close_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Closed trades kept per instrument in the Redis journal
    pub journal_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            journal_cap: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    /// Signal verdicts kept in each frame
    pub history_len: usize,
    /// Log frames as JSON instead of a summary line
    pub json: bool,
    /// Closed trades carried in each frame
    pub recent_trades: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            history_len: 20,
            json: false,
            recent_trades: 10,
        }
    }
}

/// Top-level configuration
///
/// Loaded from an optional TOML file, then `FLOWBOT_*` environment variables
/// (nested keys separated by `__`, e.g. `FLOWBOT_GATEWAY__MODE=binance`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub instruments: Vec<InstrumentConfig>,
    pub risk_profiles: RiskProfiles,
    pub indicators: IndicatorConfig,
    pub signal: SignalConfig,
    pub netflow: NetflowConfig,
    pub schedule: Schedule,
    pub gateway: GatewayConfig,
    pub lifecycle: LifecycleSection,
    pub store: StoreConfig,
    pub display: DisplayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            instruments: vec![InstrumentConfig {
                symbol: "BTCUSDT".to_string(),
                risk_profile: default_profile_name(),
                netflow_csv: Some(PathBuf::from("btc_spot_netflow.csv")),
            }],
            risk_profiles: RiskProfiles::default(),
            indicators: IndicatorConfig::default(),
            signal: SignalConfig::default(),
            netflow: NetflowConfig::default(),
            schedule: Schedule::default(),
            gateway: GatewayConfig::default(),
            lifecycle: LifecycleSection::default(),
            store: StoreConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `path` (required) or `flowbot.toml` (optional), layered with the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false),
        };
        Self::build(
            Config::builder().add_source(file),
            Environment::with_prefix(ENV_PREFIX),
        )
    }

    /// Parse TOML text, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::finish(settings.try_deserialize()?)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        env: Environment,
    ) -> Result<Self, ConfigError> {
        let settings = builder
            .add_source(env.prefix_separator("_").separator("__").try_parsing(true))
            .build()?;
        Self::finish(settings.try_deserialize()?)
    }

    fn finish(config: AppConfig) -> Result<Self, ConfigError> {
        let config = AppConfig {
            risk_profiles: config.risk_profiles.with_default(),
            ..config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instruments.is_empty() {
            return Err(ConfigError::NoInstruments);
        }

        let mut seen = HashSet::new();
        for instrument in &self.instruments {
            if !seen.insert(instrument.symbol.as_str()) {
                return Err(ConfigError::DuplicateInstrument(instrument.symbol.clone()));
            }
            if self.risk_profiles.get(&instrument.risk_profile).is_err() {
                return Err(ConfigError::UnknownProfile {
                    symbol: instrument.symbol.clone(),
                    profile: instrument.risk_profile.clone(),
                });
            }
        }

        let mut sources: HashMap<&Path, &str> = HashMap::new();
        for instrument in &self.instruments {
            let path = instrument
                .netflow_csv
                .as_deref()
                .ok_or_else(|| ConfigError::NoNetflowSource(instrument.symbol.clone()))?;
            if let Some(first) = sources.insert(path, instrument.symbol.as_str()) {
                return Err(ConfigError::SharedNetflowSource {
                    first: first.to_string(),
                    second: instrument.symbol.clone(),
                    path: path.to_path_buf(),
                });
            }
        }
        self.risk_profiles.validate()?;

        let ind = &self.indicators;
        if ind.short_ma_period == 0 || ind.rsi_period == 0 {
            return Err(invalid("indicators", "periods must be positive"));
        }
        if ind.short_ma_period >= ind.long_ma_period {
            return Err(invalid(
                "indicators",
                format!(
                    "short MA period {} must be below long MA period {}",
                    ind.short_ma_period, ind.long_ma_period
                ),
            ));
        }

        if !(self.signal.rsi_oversold < self.signal.rsi_overbought) {
            return Err(invalid("signal", "rsi_oversold must be below rsi_overbought"));
        }

        for window in NetflowWindow::ALL {
            let w = self.netflow.window(window);
            if !(w.bullish_below < w.bearish_above) {
                return Err(invalid(
                    "netflow",
                    format!("{} bullish_below must be below bearish_above", window),
                ));
            }
            if w.expected_interval_secs == 0 {
                return Err(invalid(
                    "netflow",
                    format!("{} expected_interval_secs must be positive", window),
                ));
            }
        }
        if CrawlerClock::from_offset_minutes(self.netflow.csv_utc_offset_minutes).is_none() {
            return Err(invalid(
                "netflow",
                "csv_utc_offset_minutes must be within ±24 hours",
            ));
        }

        let s = &self.schedule;
        if s.price_poll_secs == 0
            || s.netflow_poll_secs == 0
            || s.signal_secs == 0
            || s.monitor_secs == 0
        {
            return Err(invalid("schedule", "intervals must be positive"));
        }
        if s.monitor_secs > s.signal_secs {
            tracing::warn!(
                "Monitor interval ({}s) is longer than signal interval ({}s)",
                s.monitor_secs,
                s.signal_secs
            );
        }

        if self.gateway.timeout_secs == 0 {
            return Err(invalid("gateway", "timeout_secs must be positive"));
        }
        // Adopting or resuming a live position needs state that outlives the process
        if self.gateway.mode == GatewayMode::Binance && self.store.backend == StoreBackend::Memory {
            return Err(invalid(
                "store",
                "binance mode needs backend = \"redis\"; memory state is lost on restart",
            ));
        }
        if !(self.gateway.paper_balance > 0.0) {
            return Err(invalid("gateway", "paper_balance must be positive"));
        }

        Ok(())
    }

    pub fn risk_for(&self, instrument: &InstrumentConfig) -> Result<&RiskProfile, ConfigError> {
        Ok(self.risk_profiles.get(&instrument.risk_profile)?)
    }

    /// Zone the netflow crawler writes timestamps in
    pub fn crawler_clock(&self) -> CrawlerClock {
        CrawlerClock::from_offset_minutes(self.netflow.csv_utc_offset_minutes).unwrap_or_default()
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            call_timeout_secs: self.gateway.timeout_secs,
            max_close_attempts: self.lifecycle.max_close_attempts,
            recent_trades: self.display.recent_trades,
        }
    }
}
