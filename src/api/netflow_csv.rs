use super::NetflowSource;
use crate::models::{NetflowTick, NetflowWindow};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};

pub const TIMESTAMP_FORMAT: &str = "%d %b %Y, %H:%M";

/// Parse a crawler value: plain or thousands-separated numbers, optionally
/// `$`-prefixed with a K/M/B/T suffix
pub fn parse_flow_value(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '$')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let (number, multiplier) = match cleaned.chars().last()? {
        'K' => (&cleaned[..cleaned.len() - 1], 1e3),
        'M' => (&cleaned[..cleaned.len() - 1], 1e6),
        'B' => (&cleaned[..cleaned.len() - 1], 1e9),
        'T' => (&cleaned[..cleaned.len() - 1], 1e12),
        _ => (cleaned.as_str(), 1.0),
    };

    number.parse::<f64>().ok().map(|v| v * multiplier)
}

/// Zone of the crawler's wall-clock timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrawlerClock {
    /// This host's zone, for a crawler running alongside
    #[default]
    Local,
    Offset(FixedOffset),
}

impl CrawlerClock {
    /// `None` means local; an out-of-range offset is `None` too
    pub fn from_offset_minutes(minutes: Option<i32>) -> Option<Self> {
        match minutes {
            None => Some(CrawlerClock::Local),
            Some(m) => FixedOffset::east_opt(m * 60).map(CrawlerClock::Offset),
        }
    }

    fn to_utc(self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            // Ambiguous fall-back hour: take the earlier instant
            CrawlerClock::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
            CrawlerClock::Offset(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Crawler timestamps carry no zone; `clock` says which one they were written in
pub fn parse_timestamp(raw: &str, clock: CrawlerClock) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).ok()?;
    clock.to_utc(naive)
}

/// Reads the exchange-netflow crawler's CSV export
///
/// Header is `Timestamp` followed by window columns (`5m`, `15m`, ..., `1h`, ...).
/// Rows are appended by the crawler; the newest row by timestamp wins.
pub struct CsvNetflowSource {
    path: PathBuf,
    clock: CrawlerClock,
}

impl CsvNetflowSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            clock: CrawlerClock::default(),
        }
    }

    pub fn with_clock(mut self, clock: CrawlerClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse CSV content into ticks from its newest row
    pub fn parse_latest(
        content: &[u8],
        instrument: &str,
        clock: CrawlerClock,
    ) -> Result<Vec<NetflowTick>> {
        let (window_cols, rows) = Self::read_rows(content, clock)?;

        let latest = rows.into_iter().max_by_key(|(timestamp, _)| *timestamp);

        Ok(latest
            .map(|(timestamp, record)| Self::row_ticks(&window_cols, timestamp, &record, instrument))
            .unwrap_or_default())
    }

    /// Every row as ticks, oldest first (backtest replay)
    pub fn parse_history(
        content: &[u8],
        instrument: &str,
        clock: CrawlerClock,
    ) -> Result<Vec<NetflowTick>> {
        let (window_cols, mut rows) = Self::read_rows(content, clock)?;
        rows.sort_by_key(|(timestamp, _)| *timestamp);

        Ok(rows
            .iter()
            .flat_map(|(timestamp, record)| Self::row_ticks(&window_cols, *timestamp, record, instrument))
            .collect())
    }

    /// Window column positions plus every row with a valid timestamp
    fn read_rows(
        content: &[u8],
        clock: CrawlerClock,
    ) -> Result<(Vec<(NetflowWindow, usize)>, Vec<(DateTime<Utc>, csv::StringRecord)>)> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content);

        let headers = reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h == name);
        let ts_col = column("Timestamp").ok_or("netflow CSV has no Timestamp column")?;
        let window_cols: Vec<(NetflowWindow, usize)> = NetflowWindow::ALL
            .iter()
            .filter_map(|w| column(w.as_str()).map(|c| (*w, c)))
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            match record.get(ts_col).and_then(|raw| parse_timestamp(raw, clock)) {
                Some(timestamp) => rows.push((timestamp, record)),
                None => tracing::debug!("Skipping netflow row with bad timestamp: {:?}", record),
            }
        }

        Ok((window_cols, rows))
    }

    fn row_ticks(
        window_cols: &[(NetflowWindow, usize)],
        timestamp: DateTime<Utc>,
        record: &csv::StringRecord,
        instrument: &str,
    ) -> Vec<NetflowTick> {
        let mut ticks = Vec::new();
        for (window, col) in window_cols {
            match record.get(*col).and_then(parse_flow_value) {
                Some(net_flow_usd) => ticks.push(NetflowTick {
                    instrument: instrument.to_string(),
                    window: *window,
                    net_flow_usd,
                    timestamp,
                }),
                None => tracing::warn!(
                    "Netflow {} value missing or unparseable at {}",
                    window,
                    timestamp
                ),
            }
        }
        ticks
    }
}

#[async_trait]
impl NetflowSource for CsvNetflowSource {
    async fn latest(&self, instrument: &str) -> Result<Vec<NetflowTick>> {
        let content = tokio::fs::read(&self.path).await.map_err(|e| {
            format!("failed to read netflow CSV {}: {}", self.path.display(), e)
        })?;
        Self::parse_latest(&content, instrument, self.clock)
    }
}
