use flowbot::backtest::{BacktestRunner, BacktestSettings, MarketScenario, SyntheticDataGenerator};
use flowbot::risk::RiskProfile;
use flowbot::{ExitReason, NetflowWindow};

#[tokio::test]
async fn test_flow_reversals_backtest() {
    let series = SyntheticDataGenerator::new(42).generate(MarketScenario::FlowReversals, 600, 5);
    assert!(series
        .netflow
        .iter()
        .any(|t| t.window == NetflowWindow::OneHour));

    let runner = BacktestRunner::new(BacktestSettings::default());
    let metrics = runner.run(series.prices, series.netflow).await.unwrap();

    assert_eq!(
        metrics.winning_trades + metrics.losing_trades,
        metrics.total_trades
    );
    assert_eq!(metrics.long_trades + metrics.short_trades, metrics.total_trades);
    assert!(metrics.total_trades <= metrics.directional_signals);
    assert!(metrics.max_drawdown_pct >= 0.0);

    for trade in &metrics.trades {
        // Every exit except the final manual close respects the holding limit
        if trade.exit_reason != ExitReason::Manual {
            assert!(trade.holding_minutes() <= 60 + 5);
        }
    }
}

#[tokio::test]
async fn test_tighter_holding_limit_only_shortens_trades() {
    let risk = RiskProfile {
        max_duration_secs: 10 * 60,
        ..RiskProfile::default()
    };
    let runner = BacktestRunner::new(BacktestSettings {
        risk,
        ..BacktestSettings::default()
    });

    let series = SyntheticDataGenerator::new(3).generate(MarketScenario::Volatile, 400, 5);
    let metrics = runner.run(series.prices, series.netflow).await.unwrap();

    assert!(metrics
        .trades
        .iter()
        .all(|t| t.holding_minutes() <= 10 + 5));
    assert!(metrics.max_holding_period_minutes <= 15);
}
