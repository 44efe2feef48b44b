use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, ValueEnum};
use flowbot::api::netflow_csv::CrawlerClock;
use flowbot::api::CsvNetflowSource;
use flowbot::backtest::{BacktestMetrics, BacktestRunner, BacktestSettings, MarketScenario, SyntheticDataGenerator};
use flowbot::config::AppConfig;
use flowbot::models::PriceTick;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "backtest", about = "Replay synthetic or recorded data through the signal engine")]
struct Args {
    /// Configuration file for signal, netflow and risk settings
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Synthetic scenario to run when no price CSV is given
    #[arg(long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,
    #[arg(long, default_value_t = 500)]
    ticks: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// CSV of closes: `timestamp,close` (RFC 3339 or epoch milliseconds)
    #[arg(long)]
    prices: Option<PathBuf>,
    /// Netflow crawler CSV replayed alongside `--prices`
    #[arg(long, requires = "prices")]
    netflow: Option<PathBuf>,
    /// Print metrics as JSON instead of the report
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    All,
    Uptrend,
    Downtrend,
    Sideways,
    Volatile,
    Gaps,
    Reversals,
}

impl Scenario {
    fn scenarios(self) -> Vec<MarketScenario> {
        match self {
            Scenario::All => MarketScenario::ALL.to_vec(),
            Scenario::Uptrend => vec![MarketScenario::Uptrend],
            Scenario::Downtrend => vec![MarketScenario::Downtrend],
            Scenario::Sideways => vec![MarketScenario::Sideways],
            Scenario::Volatile => vec![MarketScenario::Volatile],
            Scenario::Gaps => vec![MarketScenario::WithGaps],
            Scenario::Reversals => vec![MarketScenario::FlowReversals],
        }
    }
}

#[derive(Serialize)]
struct ScenarioResult<'a> {
    scenario: &'a str,
    metrics: &'a BacktestMetrics,
}

#[derive(Debug, Deserialize)]
struct CloseRow {
    timestamp: String,
    close: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    flowbot::setup_logging("flowbot=info");

    let args = Args::parse();
    let settings = settings_from(args.config.as_deref())?;
    let runner = BacktestRunner::new(settings);

    if !args.json {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║            FLOWBOT BACKTESTING SUITE                 ║");
        println!("╚═══════════════════════════════════════════════════════╝");
    }

    if let Some(path) = &args.prices {
        let instrument = runner.settings().instrument.clone();
        let prices = load_closes(path, &instrument)?;
        let netflow = match &args.netflow {
            Some(path) => {
                let content = std::fs::read(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let clock = CrawlerClock::from_offset_minutes(
                    runner.settings().netflow.csv_utc_offset_minutes,
                )
                .context("csv_utc_offset_minutes out of range")?;
                CsvNetflowSource::parse_history(&content, &instrument, clock)
                    .map_err(|e| anyhow::anyhow!(e))?
            }
            None => Vec::new(),
        };

        if args.json {
            let metrics = runner.run(prices, netflow).await.map_err(|e| anyhow::anyhow!(e))?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        } else {
            let name = path.display().to_string();
            runner
                .run_and_report(prices, netflow, &name)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        return Ok(());
    }

    let mut all_metrics = Vec::new();
    for scenario in args.scenario.scenarios() {
        let series = SyntheticDataGenerator::new(args.seed)
            .with_instrument(runner.settings().instrument.clone())
            .generate(scenario, args.ticks, 5);

        let result = if args.json {
            runner.run(series.prices, series.netflow).await
        } else {
            runner
                .run_and_report(series.prices, series.netflow, scenario.label())
                .await
        };

        match result {
            Ok(metrics) => all_metrics.push((scenario.label().to_string(), metrics)),
            Err(e) => eprintln!("❌ Backtest failed for {}: {}", scenario.label(), e),
        }
    }

    if args.json {
        let by_name: Vec<ScenarioResult> = all_metrics
            .iter()
            .map(|(name, metrics)| ScenarioResult { scenario: name, metrics })
            .collect();
        println!("{}", serde_json::to_string_pretty(&by_name)?);
    } else {
        print_summary_comparison(&all_metrics);
    }

    Ok(())
}

/// Risk profile of the first configured instrument, plus signal settings
fn settings_from(path: Option<&Path>) -> anyhow::Result<BacktestSettings> {
    let Some(path) = path else {
        return Ok(BacktestSettings::default());
    };

    let config = AppConfig::load(Some(path))?;
    let instrument = config
        .instruments
        .first()
        .context("configuration has no instruments")?;

    Ok(BacktestSettings {
        instrument: instrument.symbol.clone(),
        indicators: config.indicators.clone(),
        signal: config.signal.clone(),
        netflow: config.netflow.clone(),
        risk: config.risk_for(instrument)?.clone(),
    })
}

fn parse_row_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Some(ts.with_timezone(&Utc));
    }
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn load_closes(path: &Path, instrument: &str) -> anyhow::Result<Vec<PriceTick>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut ticks = Vec::new();
    for (line, row) in reader.deserialize::<CloseRow>().enumerate() {
        let row = row.with_context(|| format!("Bad row {} in {}", line + 2, path.display()))?;
        let timestamp = parse_row_timestamp(&row.timestamp)
            .with_context(|| format!("Bad timestamp {:?} on row {}", row.timestamp, line + 2))?;
        ticks.push(PriceTick::new(instrument, timestamp, row.close));
    }
    ticks.sort_by_key(|t| t.timestamp);

    Ok(ticks)
}

fn print_summary_comparison(results: &[(String, BacktestMetrics)]) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║              SCENARIO COMPARISON                      ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");

    println!(
        "{:<30} {:>10} {:>8} {:>8} {:>8}",
        "Scenario", "Return%", "Trades", "Win%", "MaxDD%"
    );
    println!("{}", "─".repeat(70));

    for (name, metrics) in results {
        println!(
            "{:<30} {:>10.2} {:>8} {:>8.1} {:>8.2}",
            name,
            metrics.total_return_pct,
            metrics.total_trades,
            metrics.win_rate,
            metrics.max_drawdown_pct
        );
    }

    println!("\n");

    if let Some((best_name, best_metrics)) = results
        .iter()
        .max_by(|a, b| a.1.total_return_pct.total_cmp(&b.1.total_return_pct))
    {
        println!(
            "🏆 Best Scenario: {} ({:+.2}%)",
            best_name, best_metrics.total_return_pct
        );
    }

    if let Some((worst_name, worst_metrics)) = results
        .iter()
        .min_by(|a, b| a.1.total_return_pct.total_cmp(&b.1.total_return_pct))
    {
        println!(
            "⚠️  Worst Scenario: {} ({:+.2}%)",
            worst_name, worst_metrics.total_return_pct
        );
    }

    let total_trades: usize = results.iter().map(|(_, m)| m.total_trades).sum();
    let avg_win_rate: f64 = if !results.is_empty() {
        results.iter().map(|(_, m)| m.win_rate).sum::<f64>() / results.len() as f64
    } else {
        0.0
    };

    println!("\n📊 Overall Statistics:");
    println!("   Total Trades Across All Scenarios: {}", total_trades);
    println!("   Average Win Rate: {:.1}%", avg_win_rate);

    println!("\n═══════════════════════════════════════════════════════\n");
}
