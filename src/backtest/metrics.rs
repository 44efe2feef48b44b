use crate::models::{ExitReason, Side, Trade};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Complete backtest performance metrics
///
/// Returns are leveraged percent returns per trade; totals and drawdown are
/// sums of those, not a compounded equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // Trade Statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub long_trades: usize,
    pub short_trades: usize,

    // Return Distribution
    pub total_return_pct: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub largest_win_pct: f64,
    pub largest_loss_pct: f64,
    pub profit_factor: f64, // Total wins / Total losses

    /// Quote-currency P&L at the configured size
    pub total_pnl: f64,

    // Risk Metrics
    pub max_drawdown_pct: f64,

    // Holding Period
    pub avg_holding_period_minutes: f64,
    pub max_holding_period_minutes: i64,

    pub exit_reasons: BTreeMap<ExitReason, usize>,
    /// Fused signals that had a direction
    pub directional_signals: usize,

    pub trades: Vec<Trade>,
}

impl BacktestMetrics {
    pub fn from_trades(trades: Vec<Trade>, directional_signals: usize) -> Self {
        let total_trades = trades.len();
        if total_trades == 0 {
            return Self::empty(directional_signals);
        }

        let returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
        let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
        let losses: Vec<f64> = returns.iter().copied().filter(|r| *r <= 0.0).collect();

        let total_wins: f64 = wins.iter().sum();
        let total_losses: f64 = losses.iter().map(|r| r.abs()).sum();

        let avg_win_pct = if wins.is_empty() {
            0.0
        } else {
            total_wins / wins.len() as f64
        };
        let avg_loss_pct = if losses.is_empty() {
            0.0
        } else {
            total_losses / losses.len() as f64
        };

        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let holding: Vec<i64> = trades.iter().map(Trade::holding_minutes).collect();

        let mut exit_reasons = BTreeMap::new();
        for trade in &trades {
            *exit_reasons.entry(trade.exit_reason).or_insert(0) += 1;
        }

        Self {
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: wins.len() as f64 / total_trades as f64 * 100.0,
            long_trades: trades.iter().filter(|t| t.position.side == Side::Long).count(),
            short_trades: trades.iter().filter(|t| t.position.side == Side::Short).count(),
            total_return_pct: returns.iter().sum(),
            avg_win_pct,
            avg_loss_pct,
            largest_win_pct: wins.iter().copied().fold(0.0, f64::max),
            largest_loss_pct: losses.iter().copied().fold(0.0, f64::min),
            profit_factor,
            total_pnl: trades.iter().map(|t| t.realized_pnl).sum(),
            max_drawdown_pct: Self::calculate_drawdown(&returns),
            avg_holding_period_minutes: holding.iter().sum::<i64>() as f64 / holding.len() as f64,
            max_holding_period_minutes: holding.iter().copied().max().unwrap_or(0),
            exit_reasons,
            directional_signals,
            trades,
        }
    }

    fn empty(directional_signals: usize) -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            long_trades: 0,
            short_trades: 0,
            total_return_pct: 0.0,
            avg_win_pct: 0.0,
            avg_loss_pct: 0.0,
            largest_win_pct: 0.0,
            largest_loss_pct: 0.0,
            profit_factor: 0.0,
            total_pnl: 0.0,
            max_drawdown_pct: 0.0,
            avg_holding_period_minutes: 0.0,
            max_holding_period_minutes: 0,
            exit_reasons: BTreeMap::new(),
            directional_signals,
            trades: vec![],
        }
    }

    /// Largest peak-to-trough fall of the cumulative return, in percentage points
    fn calculate_drawdown(returns: &[f64]) -> f64 {
        let mut peak = 0.0_f64;
        let mut current = 0.0;
        let mut max_dd = 0.0;

        for r in returns {
            current += r;
            peak = peak.max(current);
            let drawdown = peak - current;
            if drawdown > max_dd {
                max_dd = drawdown;
            }
        }

        max_dd
    }

    pub fn exit_count(&self, reason: ExitReason) -> usize {
        self.exit_reasons.get(&reason).copied().unwrap_or(0)
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║              BACKTEST PERFORMANCE REPORT              ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        println!("📊 RETURN SUMMARY");
        println!("  Total Return:          {:+.2}%", self.total_return_pct);
        println!("  P&L (quote):           ${:.2}", self.total_pnl);
        println!("  Directional Signals:   {}", self.directional_signals);

        println!("\n📈 TRADE STATISTICS");
        println!("  Total Trades:          {}", self.total_trades);
        println!(
            "  Long / Short:          {} / {}",
            self.long_trades, self.short_trades
        );
        println!(
            "  Winning Trades:        {} ({:.1}%)",
            self.winning_trades, self.win_rate
        );
        println!("  Losing Trades:         {}", self.losing_trades);

        if self.total_trades > 0 {
            println!("\n💰 WIN/LOSS ANALYSIS");
            println!("  Average Win:           {:+.2}%", self.avg_win_pct);
            println!("  Average Loss:          -{:.2}%", self.avg_loss_pct);
            println!("  Largest Win:           {:+.2}%", self.largest_win_pct);
            println!("  Largest Loss:          {:+.2}%", self.largest_loss_pct);
            println!("  Profit Factor:         {:.2}", self.profit_factor);

            println!("\n⚠️  RISK METRICS");
            println!("  Max Drawdown:          {:.2}%", self.max_drawdown_pct);

            println!("\n⏱️  HOLDING PERIODS");
            println!(
                "  Average:               {:.1} minutes",
                self.avg_holding_period_minutes
            );
            println!(
                "  Max:                   {} minutes",
                self.max_holding_period_minutes
            );

            println!("\n🚪 EXIT REASONS");
            for (reason, count) in &self.exit_reasons {
                println!("  {:<22} {}", format!("{}:", reason), count);
            }
        }

        println!("\n═══════════════════════════════════════════════════════\n");
    }
}
