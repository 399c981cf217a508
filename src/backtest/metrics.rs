//! Performance statistics over a finished run.
//!
//! Daily-return ratios use sample standard deviation and are annualized
//! with sqrt(252). Ratios that would divide by zero use the 999.99 sentinel
//! (no losses / no downside) or 0 (not enough data).

use serde::{Deserialize, Serialize};

use super::executor::{DailyStats, EquityPoint, Trade};

/// Stand-in for an unbounded ratio.
pub const RATIO_CAP: f64 = 999.99;
const TRADING_DAYS: f64 = 252.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,

    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,

    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_profit: f64,
    pub profit_factor: f64,
    pub average_trade: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,

    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,

    pub avg_trade_duration_secs: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,

    pub total_commission: f64,
    pub total_slippage: f64,
}

pub fn calculate(
    trades: &[Trade],
    daily: &[DailyStats],
    equity: &[EquityPoint],
    initial_capital: f64,
    final_capital: f64,
) -> PerformanceMetrics {
    let total_return = final_capital - initial_capital;
    let total_return_pct = if initial_capital > 0.0 { total_return / initial_capital * 100.0 } else { 0.0 };

    let wins: Vec<f64> = trades.iter().filter(|t| t.is_win()).map(|t| t.net_pnl).collect();
    let losses: Vec<f64> = trades.iter().filter(|t| !t.is_win()).map(|t| t.net_pnl).collect();
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().filter(|p| **p < 0.0).map(|p| -p).sum();
    let net_profit: f64 = trades.iter().map(|t| t.net_pnl).sum();

    let profit_factor = if gross_loss == 0.0 {
        if gross_profit > 0.0 {
            RATIO_CAP
        } else {
            0.0
        }
    } else {
        gross_profit / gross_loss
    };

    let (max_drawdown, max_drawdown_pct) = max_drawdown(equity);
    let annualized_return_pct = annualize(total_return_pct, equity);
    let calmar_ratio = if max_drawdown_pct > 0.0 { annualized_return_pct / max_drawdown_pct } else { 0.0 };

    let returns: Vec<f64> = daily
        .iter()
        .filter(|d| d.starting_equity > 0.0)
        .map(|d| d.pnl / d.starting_equity * 100.0)
        .collect();

    let n = trades.len();
    PerformanceMetrics {
        total_return,
        total_return_pct,
        annualized_return_pct,
        total_trades: n,
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        win_rate: if n > 0 { wins.len() as f64 / n as f64 * 100.0 } else { 0.0 },
        gross_profit,
        gross_loss,
        net_profit,
        profit_factor,
        average_trade: if n > 0 { net_profit / n as f64 } else { 0.0 },
        average_win: if wins.is_empty() { 0.0 } else { gross_profit / wins.len() as f64 },
        average_loss: if losses.is_empty() { 0.0 } else { -gross_loss / losses.len() as f64 },
        largest_win: wins.iter().copied().fold(0.0, f64::max),
        largest_loss: losses.iter().copied().fold(0.0, f64::min),
        max_drawdown,
        max_drawdown_pct,
        sharpe_ratio: sharpe(&returns),
        sortino_ratio: sortino(&returns),
        calmar_ratio,
        avg_trade_duration_secs: if n > 0 {
            trades.iter().map(|t| t.duration_secs as f64).sum::<f64>() / n as f64
        } else {
            0.0
        },
        max_consecutive_wins: longest_run(trades, true),
        max_consecutive_losses: longest_run(trades, false),
        total_commission: trades.iter().map(|t| t.commission).sum(),
        total_slippage: trades.iter().map(|t| t.slippage).sum(),
    }
}

/// Peak-to-trough drawdown in dollars and percent of the running peak.
pub fn max_drawdown(equity: &[EquityPoint]) -> (f64, f64) {
    let Some(first) = equity.first() else {
        return (0.0, 0.0);
    };
    let mut peak = first.equity;
    let mut dd = 0.0_f64;
    let mut dd_pct = 0.0_f64;
    for p in equity {
        peak = peak.max(p.equity);
        dd = dd.max(peak - p.equity);
        if peak > 0.0 {
            dd_pct = dd_pct.max((peak - p.equity) / peak * 100.0);
        }
    }
    (dd, dd_pct)
}

fn annualize(total_return_pct: f64, equity: &[EquityPoint]) -> f64 {
    let (Some(first), Some(last)) = (equity.first(), equity.last()) else {
        return 0.0;
    };
    let days = (last.ts - first.ts) as f64 / 86_400.0;
    let growth = 1.0 + total_return_pct / 100.0;
    if days < 1.0 || growth <= 0.0 {
        return total_return_pct;
    }
    (growth.powf(365.0 / days) - 1.0) * 100.0
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let avg = mean(returns);
    let var = returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let std = var.sqrt();
    if std == 0.0 {
        return 0.0;
    }
    avg / std * TRADING_DAYS.sqrt()
}

pub fn sortino(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return RATIO_CAP;
    }
    let dev = (downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64).sqrt();
    if dev == 0.0 {
        return 0.0;
    }
    mean(returns) / dev * TRADING_DAYS.sqrt()
}

fn longest_run(trades: &[Trade], wins: bool) -> usize {
    let mut best = 0;
    let mut cur = 0;
    for t in trades {
        if t.is_win() == wins {
            cur += 1;
            best = best.max(cur);
        } else {
            cur = 0;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(net: f64) -> Trade {
        Trade { net_pnl: net, gross_pnl: net, commission: 2.0, duration_secs: 60, ..Default::default() }
    }

    fn point(ts: i64, equity: f64) -> EquityPoint {
        EquityPoint { ts, equity, cash: equity, unrealized_pnl: 0.0 }
    }

    #[test]
    fn test_trade_statistics() {
        let trades = vec![trade(100.0), trade(50.0), trade(-30.0), trade(20.0), trade(-10.0), trade(-5.0)];
        let m = calculate(&trades, &[], &[], 10_000.0, 10_125.0);
        assert_eq!(m.total_trades, 6);
        assert_eq!(m.winning_trades, 3);
        assert!((m.win_rate - 50.0).abs() < 1e-9);
        assert!((m.profit_factor - 170.0 / 45.0).abs() < 1e-9);
        assert_eq!(m.largest_win, 100.0);
        assert_eq!(m.largest_loss, -30.0);
        assert_eq!(m.max_consecutive_wins, 2);
        assert_eq!(m.max_consecutive_losses, 2);
        assert!((m.total_commission - 12.0).abs() < 1e-9);
        assert!((m.total_return_pct - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_profit_factor_sentinel() {
        let m = calculate(&[trade(10.0)], &[], &[], 1000.0, 1010.0);
        assert_eq!(m.profit_factor, RATIO_CAP);
        let m = calculate(&[], &[], &[], 1000.0, 1000.0);
        assert_eq!(m.profit_factor, 0.0);
    }

    #[test]
    fn test_drawdown() {
        let eq = vec![point(0, 100.0), point(1, 120.0), point(2, 90.0), point(3, 130.0), point(4, 117.0)];
        let (dd, pct) = max_drawdown(&eq);
        assert!((dd - 30.0).abs() < 1e-9);
        assert!((pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_ratio_edges() {
        assert_eq!(sharpe(&[1.0]), 0.0);
        assert_eq!(sharpe(&[1.0, 1.0, 1.0]), 0.0);
        assert_eq!(sortino(&[1.0, 2.0]), RATIO_CAP);
        assert!(sharpe(&[1.0, 2.0, 3.0]) > 0.0);
        assert!(sortino(&[1.0, -2.0, 3.0]) > 0.0);
    }
}
