use super::PriceSource;
use crate::execution::{GatewayError, OrderGateway};
use crate::models::{Fill, Position, PriceTick, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

pub const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";
pub const MAINNET_BASE_URL: &str = "https://fapi.binance.com";

const RATE_LIMIT_RPS: u32 = 10;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_RECV_WINDOW_MS: u64 = 5000;

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Read `BINANCE_API_KEY` / `BINANCE_API_SECRET`
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("BINANCE_API_KEY").ok()?;
        let api_secret = std::env::var("BINANCE_API_SECRET").ok()?;
        if api_key.is_empty() || api_secret.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            api_secret,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    status: String,
    avg_price: String,
    executed_qty: String,
    update_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    position_amt: String,
    entry_price: String,
    leverage: String,
    #[serde(default)]
    update_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountBalance {
    asset: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    quantity_precision: u32,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

/// Quantity rules for a symbol, from `exchangeInfo`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LotSize {
    pub step_size: f64,
    pub min_qty: f64,
    pub precision: u32,
}

impl LotSize {
    fn from_info(info: &SymbolInfo) -> Result<Self, GatewayError> {
        let lot = info
            .filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("LOT_SIZE"));
        let field = |name: &str| -> Result<f64, GatewayError> {
            match lot.and_then(|f| f.get(name)).and_then(|v| v.as_str()) {
                Some(raw) => parse_num(name, raw),
                None => Ok(0.0),
            }
        };

        Ok(Self {
            step_size: field("stepSize")?,
            min_qty: field("minQty")?,
            precision: info.quantity_precision,
        })
    }

    /// Round down to the step and precision; `None` below the minimum quantity
    pub fn round(&self, quantity: f64) -> Option<String> {
        let stepped = if self.step_size > 0.0 {
            // Nudge so 0.3 / 0.1 does not floor to 2
            ((quantity / self.step_size) + 1e-9).floor() * self.step_size
        } else {
            quantity
        };
        let scale = 10f64.powi(self.precision as i32);
        let rounded = ((stepped * scale) + 1e-9).floor() / scale;

        if rounded <= 0.0 || rounded < self.min_qty {
            return None;
        }
        Some(format!("{:.*}", self.precision as usize, rounded))
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

fn parse_num(field: &str, raw: &str) -> Result<f64, GatewayError> {
    raw.parse::<f64>()
        .map_err(|_| GatewayError::Decode(format!("{} is not a number: {:?}", field, raw)))
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// HMAC-SHA256 signature of a query string, hex encoded
fn sign(secret: &str, payload: &str) -> Result<String, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Rejected(format!("invalid API secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn order_side(side: Side) -> &'static str {
    match side {
        Side::Long => "BUY",
        Side::Short => "SELL",
    }
}

/// USDⓈ-M futures REST client
///
/// Acts as the live `OrderGateway` (signed endpoints) and as the
/// `PriceSource` for closed 5m klines. Clones share the rate limiter.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    recv_window_ms: u64,
    rate_limiter: Arc<BinanceRateLimiter>,
    lot_sizes: Arc<Mutex<HashMap<String, LotSize>>>,
}

impl BinanceFuturesClient {
    pub fn new(base_url: impl Into<String>, credentials: Option<Credentials>) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            lot_sizes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn testnet(credentials: Option<Credentials>) -> crate::Result<Self> {
        Self::new(TESTNET_BASE_URL, credentials)
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn encode(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Send a request and decode the JSON body
    ///
    /// GETs are retried with exponential backoff on 429, 5xx and network errors.
    /// Orders are sent once: a lost response must not turn into a second order.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<T, GatewayError> {
        let retries = if method == Method::GET { MAX_RETRIES } else { 1 };
        let mut last_error = GatewayError::Transport("no attempt made".to_string());

        for attempt in 1..=retries {
            self.rate_limiter.until_ready().await;

            let mut request = self
                .client
                .request(method.clone(), self.url(path, &params, signed)?);
            if let Some(credentials) = &self.credentials {
                request = request.header("X-MBX-APIKEY", &credentials.api_key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(GatewayError::from);
                    }

                    let body = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(
                            "Binance {} {} returned {} (attempt {}/{})",
                            method,
                            path,
                            status,
                            attempt,
                            retries
                        );
                        last_error = GatewayError::Transport(format!("HTTP {}: {}", status, body));
                    } else {
                        let message = serde_json::from_str::<ApiError>(&body)
                            .map(|e| format!("{} ({})", e.msg, e.code))
                            .unwrap_or(body);
                        return Err(GatewayError::Rejected(message));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Binance {} {} failed: {} (attempt {}/{})",
                        method,
                        path,
                        e,
                        attempt,
                        retries
                    );
                    last_error = GatewayError::from(e);
                }
            }

            if attempt < retries {
                sleep(Duration::from_millis(INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1))).await;
            }
        }

        Err(last_error)
    }

    fn url(&self, path: &str, params: &[(&str, String)], signed: bool) -> Result<String, GatewayError> {
        let mut query = Self::encode(params);

        if signed {
            let credentials = self.credentials.as_ref().ok_or_else(|| {
                GatewayError::Rejected("signed endpoint requires API credentials".to_string())
            })?;
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!(
                "recvWindow={}&timestamp={}",
                self.recv_window_ms,
                Utc::now().timestamp_millis()
            ));
            let signature = sign(&credentials.api_secret, &query)?;
            query.push_str(&format!("&signature={}", signature));
        }

        if query.is_empty() {
            Ok(format!("{}{}", self.base_url, path))
        } else {
            Ok(format!("{}{}?{}", self.base_url, path, query))
        }
    }

    async fn position_risk(&self, instrument: &str) -> Result<Option<(f64, PositionRisk)>, GatewayError> {
        let risks: Vec<PositionRisk> = self
            .request(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", instrument.to_string())],
                true,
            )
            .await?;

        for risk in risks {
            let amount = parse_num("positionAmt", &risk.position_amt)?;
            if amount != 0.0 {
                return Ok(Some((amount, risk)));
            }
        }
        Ok(None)
    }

    /// Lot size rules for `instrument`, fetched once per client
    pub async fn lot_size(&self, instrument: &str) -> Result<LotSize, GatewayError> {
        if let Some(lot) = self.cached_lot_size(instrument) {
            return Ok(lot);
        }

        let info: ExchangeInfo = self
            .request(Method::GET, "/fapi/v1/exchangeInfo", vec![], false)
            .await?;

        let mut found = None;
        let mut lots = self
            .lot_sizes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for symbol in &info.symbols {
            let lot = LotSize::from_info(symbol)?;
            if symbol.symbol == instrument {
                found = Some(lot);
            }
            lots.insert(symbol.symbol.clone(), lot);
        }

        found.ok_or_else(|| GatewayError::Rejected(format!("unknown symbol {}", instrument)))
    }

    fn cached_lot_size(&self, instrument: &str) -> Option<LotSize> {
        self.lot_sizes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(instrument)
            .copied()
    }

    async fn market_order(
        &self,
        instrument: &str,
        side: &'static str,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderResponse, GatewayError> {
        let lot = self.lot_size(instrument).await?;
        let quantity = lot.round(quantity).ok_or_else(|| {
            GatewayError::Rejected(format!(
                "quantity {} below {} minimum {}",
                quantity, instrument, lot.min_qty
            ))
        })?;

        let mut params = vec![
            ("symbol", instrument.to_string()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let order: OrderResponse = self
            .request(Method::POST, "/fapi/v1/order", params, true)
            .await?;

        match order.status.as_str() {
            "FILLED" => Ok(order),
            "CANCELED" | "EXPIRED" | "REJECTED" => Err(GatewayError::Rejected(format!(
                "order {} not filled (status {})",
                order.order_id, order.status
            ))),
            // NEW, PARTIALLY_FILLED: part or all of it may still execute
            _ => Err(GatewayError::Unconfirmed(format!(
                "order {} accepted with status {}",
                order.order_id, order.status
            ))),
        }
    }

    fn fill_from(instrument: &str, side: Side, order: &OrderResponse) -> Result<Fill, GatewayError> {
        Ok(Fill {
            instrument: instrument.to_string(),
            side,
            price: parse_num("avgPrice", &order.avg_price)?,
            quantity: parse_num("executedQty", &order.executed_qty)?,
            timestamp: millis_to_utc(order.update_time),
        })
    }
}

#[async_trait]
impl OrderGateway for BinanceFuturesClient {
    async fn open_position(
        &self,
        instrument: &str,
        side: Side,
        size: f64,
        leverage: u32,
    ) -> Result<Fill, GatewayError> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", instrument.to_string()),
                    ("leverage", leverage.to_string()),
                ],
                true,
            )
            .await?;

        let order = self
            .market_order(instrument, order_side(side), size, false)
            .await?;
        let fill = Self::fill_from(instrument, side, &order)?;

        tracing::info!(
            "📤 Binance {} {} {} filled @ ${:.2} (order {})",
            order_side(side),
            fill.quantity,
            instrument,
            fill.price,
            order.order_id
        );
        Ok(fill)
    }

    async fn close_position(&self, instrument: &str) -> Result<Fill, GatewayError> {
        let Some((amount, _)) = self.position_risk(instrument).await? else {
            return Err(GatewayError::NoPosition(instrument.to_string()));
        };

        let held = if amount > 0.0 { Side::Long } else { Side::Short };
        let exit_side = held.opposite();
        let order = self
            .market_order(instrument, order_side(exit_side), amount.abs(), true)
            .await?;

        Self::fill_from(instrument, exit_side, &order)
    }

    async fn current_price(&self, instrument: &str) -> Result<f64, GatewayError> {
        let ticker: TickerPrice = self
            .request(
                Method::GET,
                "/fapi/v1/ticker/price",
                vec![("symbol", instrument.to_string())],
                false,
            )
            .await?;
        parse_num("price", &ticker.price)
    }

    async fn current_position(&self, instrument: &str) -> Result<Option<Position>, GatewayError> {
        let Some((amount, risk)) = self.position_risk(instrument).await? else {
            return Ok(None);
        };

        Ok(Some(Position {
            instrument: instrument.to_string(),
            side: if amount > 0.0 { Side::Long } else { Side::Short },
            entry_price: parse_num("entryPrice", &risk.entry_price)?,
            entry_time: millis_to_utc(risk.update_time),
            size: amount.abs(),
            leverage: risk.leverage.parse().unwrap_or(1),
        }))
    }

    async fn available_balance(&self) -> Result<f64, GatewayError> {
        let balances: Vec<AccountBalance> = self
            .request(Method::GET, "/fapi/v2/balance", vec![], true)
            .await?;

        let usdt = balances
            .iter()
            .find(|b| b.asset == "USDT")
            .ok_or_else(|| GatewayError::Decode("no USDT balance".to_string()))?;
        parse_num("availableBalance", &usdt.available_balance)
    }

    fn name(&self) -> &str {
        "binance"
    }
}

#[async_trait]
impl PriceSource for BinanceFuturesClient {
    /// Closes of finished 5m klines, oldest first
    async fn recent_closes(&self, instrument: &str, limit: usize) -> crate::Result<Vec<PriceTick>> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .request(
                Method::GET,
                "/fapi/v1/klines",
                vec![
                    ("symbol", instrument.to_string()),
                    ("interval", "5m".to_string()),
                    // One extra: the still-forming kline is dropped
                    ("limit", (limit + 1).to_string()),
                ],
                false,
            )
            .await?;

        let now = Utc::now();
        let mut ticks = Vec::with_capacity(rows.len());
        for row in rows {
            let close = row
                .get(4)
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::Decode("kline without close".to_string()))?;
            let close_time = row
                .get(6)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| GatewayError::Decode("kline without close time".to_string()))?;

            let timestamp = millis_to_utc(close_time);
            if timestamp > now {
                continue;
            }
            ticks.push(PriceTick::new(instrument, timestamp, parse_num("close", close)?));
        }

        if ticks.len() > limit {
            ticks.drain(..ticks.len() - limit);
        }
        Ok(ticks)
    }
}
