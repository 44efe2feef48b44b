use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use flowbot::api::{BinanceFuturesClient, Credentials, CsvNetflowSource, NetflowSource, PriceSource};
use flowbot::config::{AppConfig, GatewayMode, InstrumentConfig, StoreBackend};
use flowbot::engine::{self, run_display_logger, NetflowProducer, PriceProducer, Trader};
use flowbot::execution::{LifecycleEvent, OrderGateway, PaperGateway, PositionLifecycle, PositionState};
use flowbot::persistence::{MemoryPositionStore, PositionStore, RedisPositionStore};
use flowbot::strategy::SignalEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

/// How long tasks get to finish after shutdown is signalled
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "flowbot", about = "Price indicator and exchange netflow signal trader")]
struct Cli {
    /// Configuration file (defaults to ./flowbot.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Trade every configured instrument until Ctrl+C (default)
    Run,
    /// Compare stored positions with the gateway and optionally resolve a halt
    Reconcile {
        #[arg(long)]
        instrument: Option<String>,
        /// Take over the gateway's position, holding clock starting now
        #[arg(long, conflicts_with = "reset")]
        adopt: bool,
        /// Discard local state; the gateway must already be flat
        #[arg(long)]
        reset: bool,
    },
    /// Close an open position with exit reason `manual`
    Close { instrument: String },
    /// Load, validate and print the effective configuration
    CheckConfig,
}

/// Shared broker, market data and storage handles
struct Services {
    gateway: Arc<dyn OrderGateway>,
    /// Set in paper mode; marked with live prices
    paper: Option<Arc<PaperGateway>>,
    market: Arc<BinanceFuturesClient>,
    store: Arc<dyn PositionStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    flowbot::setup_logging("flowbot=info");

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Reconcile {
            instrument,
            adopt,
            reset,
        } => reconcile(config, instrument.as_deref(), adopt, reset).await,
        Command::Close { instrument } => close(config, &instrument).await,
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("\n✅ Configuration OK");
            Ok(())
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!("🚀 flowbot starting");
    log_configuration(&config);

    let services = build_services(&config).await?;
    let price_source: Arc<dyn PriceSource> = services.market.clone();
    let (stop, shutdown) = engine::shutdown_channel();
    let mut handles = Vec::new();

    for instrument in &config.instruments {
        let mut lifecycle = build_lifecycle(&config, instrument, &services).await?;
        let state = lifecycle.reconcile().await?;
        if let PositionState::Halted(mismatch) = &state {
            tracing::warn!(
                "⚠️  {} is HALTED ({}); run `flowbot reconcile --instrument {} --adopt|--reset`",
                instrument.symbol,
                mismatch,
                instrument.symbol
            );
        }

        let csv = instrument
            .netflow_csv
            .as_deref()
            .with_context(|| format!("{} has no netflow_csv", instrument.symbol))?;
        let netflow_source: Arc<dyn NetflowSource> =
            Arc::new(CsvNetflowSource::new(csv).with_clock(config.crawler_clock()));

        let (price, indicators_rx) = PriceProducer::new(
            instrument.symbol.clone(),
            price_source.clone(),
            config.indicators.clone(),
            Duration::from_secs(config.schedule.price_poll_secs),
        );
        let price = match &services.paper {
            Some(paper) => price.with_marks(paper.clone()),
            None => price,
        };
        let (netflow, netflow_rx) = NetflowProducer::new(
            instrument.symbol.clone(),
            netflow_source,
            config.netflow.clone(),
            Duration::from_secs(config.schedule.netflow_poll_secs),
        );
        let (trader, frames) = Trader::new(
            lifecycle,
            SignalEngine::new(config.signal.clone(), config.netflow.clone()),
            indicators_rx,
            netflow_rx,
            config
                .schedule
                .trader_settings(config.display.history_len, Utc::now()),
        );

        handles.extend(engine::spawn_instrument(price, netflow, trader, &shutdown));
        handles.push(tokio::spawn(run_display_logger(
            frames,
            shutdown.clone(),
            config.display.json,
        )));
    }

    tracing::info!("✅ {} tasks spawned", handles.len());
    tracing::info!("  🔄 Prices: every {}s", config.schedule.price_poll_secs);
    tracing::info!("  🌊 Netflow: every {}s", config.schedule.netflow_poll_secs);
    tracing::info!(
        "  💹 Signals: every {}s ({}s after the boundary)",
        config.schedule.signal_secs,
        config.schedule.signal_offset_secs
    );
    tracing::info!("  👀 Monitor: every {}s", config.schedule.monitor_secs);
    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
    stop.send_replace(true);

    for handle in handles {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Task failed: {}", e),
            Err(_) => tracing::warn!("Task did not stop within {:?}", SHUTDOWN_GRACE),
        }
    }

    tracing::info!("👋 flowbot stopped");
    Ok(())
}

async fn reconcile(
    config: AppConfig,
    only: Option<&str>,
    adopt: bool,
    reset: bool,
) -> anyhow::Result<()> {
    let services = build_services(&config).await?;

    for instrument in selected(&config, only)? {
        let mut lifecycle = build_lifecycle(&config, instrument, &services).await?;
        let state = lifecycle.reconcile().await?;
        println!("{}: {}", instrument.symbol, describe(&state));

        if !lifecycle.is_halted() {
            continue;
        }
        if adopt {
            let state = lifecycle.adopt_gateway_position(Utc::now()).await?;
            println!("  -> adopted: {}", describe(&state));
        } else if reset {
            lifecycle.resolve_flat().await?;
            println!("  -> reset to FLAT");
        } else {
            println!("  -> unresolved; rerun with --adopt or --reset");
        }
    }

    Ok(())
}

async fn close(config: AppConfig, symbol: &str) -> anyhow::Result<()> {
    let services = build_services(&config).await?;
    let instrument = selected(&config, Some(symbol))?
        .into_iter()
        .next()
        .with_context(|| format!("{} is not configured", symbol))?;

    let mut lifecycle = build_lifecycle(&config, instrument, &services).await?;
    let state = lifecycle.reconcile().await?;
    if !matches!(state, PositionState::Open(_)) {
        anyhow::bail!("{} has no open position ({})", symbol, describe(&state));
    }

    if let Some(paper) = &services.paper {
        let price = services
            .market
            .current_price(symbol)
            .await
            .with_context(|| format!("Failed to price {}", symbol))?;
        paper.mark_price(symbol, price);
    }

    match lifecycle.close_manual(Utc::now()).await? {
        LifecycleEvent::Closed(trade) => {
            println!(
                "✅ Closed {} {} @ ${:.2}: {:+.2}% (${:.2})",
                trade.position.side,
                symbol,
                trade.exit_price,
                trade.return_pct,
                trade.realized_pnl
            );
            Ok(())
        }
        other => anyhow::bail!("Close not confirmed: {:?}", other),
    }
}

async fn build_services(config: &AppConfig) -> anyhow::Result<Services> {
    let market = BinanceFuturesClient::new(config.gateway.resolved_base_url(), Credentials::from_env())
        .map_err(|e| anyhow::anyhow!(e))?
        .with_recv_window(config.gateway.recv_window_ms);
    let market = Arc::new(market);

    let store: Arc<dyn PositionStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryPositionStore::new()),
        StoreBackend::Redis => Arc::new(
            RedisPositionStore::connect(&config.store.redis_url)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", config.store.redis_url))?
                .with_journal_cap(config.store.journal_cap),
        ),
    };

    let (gateway, paper) = match config.gateway.mode {
        GatewayMode::Paper => {
            let paper = Arc::new(PaperGateway::new());
            paper.set_balance(config.gateway.paper_balance);
            tracing::info!("📝 Paper trading (market data from {})", config.gateway.resolved_base_url());
            let gateway: Arc<dyn OrderGateway> = paper.clone();
            (gateway, Some(paper))
        }
        GatewayMode::Binance => {
            if !market.has_credentials() {
                anyhow::bail!("Binance mode needs BINANCE_API_KEY and BINANCE_API_SECRET");
            }
            tracing::info!("💸 Live orders via {}", config.gateway.resolved_base_url());
            let gateway: Arc<dyn OrderGateway> = market.clone();
            (gateway, None)
        }
    };

    Ok(Services {
        gateway,
        paper,
        market,
        store,
    })
}

/// Build an instrument's lifecycle; paper mode restores the stored position into the simulator
async fn build_lifecycle(
    config: &AppConfig,
    instrument: &InstrumentConfig,
    services: &Services,
) -> anyhow::Result<PositionLifecycle> {
    let risk = config.risk_for(instrument)?.clone();

    if let Some(paper) = &services.paper {
        if let Some(position) = services.store.load_position(&instrument.symbol).await? {
            paper.seed_position(position);
        }
    }

    Ok(PositionLifecycle::new(
        instrument.symbol.clone(),
        risk,
        config.lifecycle_settings(),
        services.gateway.clone(),
        services.store.clone(),
    ))
}

fn selected<'a>(config: &'a AppConfig, only: Option<&str>) -> anyhow::Result<Vec<&'a InstrumentConfig>> {
    let chosen: Vec<_> = config
        .instruments
        .iter()
        .filter(|i| only.map_or(true, |symbol| i.symbol == symbol))
        .collect();
    if chosen.is_empty() {
        anyhow::bail!("No configured instrument matches {:?}", only);
    }
    Ok(chosen)
}

fn describe(state: &PositionState) -> String {
    match state {
        PositionState::Flat => "FLAT".to_string(),
        PositionState::Open(open) => format!(
            "OPEN {} {} @ ${:.2} since {}",
            open.position.side,
            open.position.size,
            open.position.entry_price,
            open.position.entry_time
        ),
        PositionState::Halted(mismatch) => format!("HALTED ({})", mismatch),
    }
}

fn log_configuration(config: &AppConfig) {
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Gateway: {:?} (timeout {}s)", config.gateway.mode, config.gateway.timeout_secs);
    tracing::info!("  Store: {:?}", config.store.backend);
    tracing::info!("  Netflow clock: {:?}", config.crawler_clock());
    for instrument in &config.instruments {
        if let Ok(risk) = config.risk_for(instrument) {
            let size = match risk.balance_pct {
                Some(pct) => format!("{}% of balance", pct),
                None => format!("size {}", risk.size),
            };
            tracing::info!(
                "    - {} [{}]: TP {:+.1}% SL {:+.1}% max {}s, {}x, {}, netflow {}",
                instrument.symbol,
                instrument.risk_profile,
                risk.take_profit_pct,
                risk.stop_loss_pct,
                risk.max_duration_secs,
                risk.leverage,
                size,
                instrument
                    .netflow_csv
                    .as_deref()
                    .map_or("-".to_string(), |p| p.display().to_string())
            );
        }
    }
}
