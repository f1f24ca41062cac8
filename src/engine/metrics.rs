// =============================================================================
// Back-test statistics
// =============================================================================
//
//   sharpe        = mean(trade returns) / std(trade returns) * sqrt(252)
//   max drawdown  = largest peak-to-trough drop over the equity curve
//   profit factor = gross wins / |gross losses|
//
// All pure functions over the engine's trade and equity records, so the
// whole module is deterministic and byte-stable across runs.
// =============================================================================

use serde::Serialize;

use super::position::TradeRecord;

/// One equity-curve sample, taken per bar in back-test mode.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub balance: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

/// Aggregate trade statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Statistics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub win_loss_ratio: f64,
    pub max_win: f64,
    pub max_loss: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
}

/// Compute the full statistics block from trades and the equity curve.
pub fn compute(trades: &[TradeRecord], equity_curve: &[EquityPoint]) -> Statistics {
    if trades.is_empty() {
        return Statistics {
            max_drawdown: max_drawdown(equity_curve),
            ..Default::default()
        };
    }

    let wins: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p <= 0.0).collect();

    let gross_win: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().sum::<f64>().abs();

    let avg_win = if wins.is_empty() { 0.0 } else { gross_win / wins.len() as f64 };
    let avg_loss = if losses.is_empty() {
        0.0
    } else {
        losses.iter().sum::<f64>() / losses.len() as f64
    };

    Statistics {
        total_trades: trades.len(),
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        win_rate: wins.len() as f64 / trades.len() as f64,
        avg_win,
        avg_loss,
        win_loss_ratio: if avg_loss != 0.0 { (avg_win / avg_loss).abs() } else { 0.0 },
        max_win: trades.iter().map(|t| t.pnl).fold(f64::MIN, f64::max).max(0.0),
        max_loss: trades.iter().map(|t| t.pnl).fold(f64::MAX, f64::min).min(0.0),
        profit_factor: if gross_loss > 0.0 { gross_win / gross_loss } else { 0.0 },
        max_drawdown: max_drawdown(equity_curve),
        sharpe_ratio: sharpe(trades),
    }
}

/// Largest relative drop from a running equity peak.
pub fn max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
    let mut peak = match equity_curve.first() {
        Some(p) => p.balance,
        None => return 0.0,
    };
    let mut max_dd: f64 = 0.0;

    for point in equity_curve {
        if point.balance > peak {
            peak = point.balance;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - point.balance) / peak);
        }
    }
    max_dd
}

/// Annualized Sharpe over per-trade returns; zero below two trades or with
/// zero variance.
pub fn sharpe(trades: &[TradeRecord]) -> f64 {
    if trades.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std = variance.sqrt();
    if std == 0.0 {
        return 0.0;
    }
    mean / std * (252.0_f64).sqrt()
}
