//! Human-readable reports and file exports.
//!
//! Text builders return `String`s so callers choose where they go (stdout,
//! a log file, a test assertion). Exports write CSV and JSON next to each
//! other under a directory.

use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::backtest::{BacktestResult, EquityPoint, Trade};
use crate::error::Result;
use crate::events::ts_to_datetime;
use crate::optimizer::{Metric, MonteCarloResult, OptimizationResult, WalkForwardResult};

// Writing into a String cannot fail.
macro_rules! w {
    ($dst:expr) => {
        $dst.push('\n')
    };
    ($dst:expr, $($arg:tt)*) => {
        let _ = writeln!($dst, $($arg)*);
    };
}

fn fmt_ts(ts: i64) -> String {
    ts_to_datetime(ts).format("%Y-%m-%d %H:%M").to_string()
}

fn rule(out: &mut String, title: &str) {
    w!(out);
    w!(out, "{}", title);
    w!(out, "{}", "-".repeat(48));
}

pub fn summary(result: &BacktestResult) -> String {
    let m = &result.metrics;
    let mut out = String::new();
    w!(out, "=== BACKTEST: {} on {} ===", result.strategy_id, result.config.symbol);

    rule(&mut out, "OVERVIEW");
    w!(out, "  Period:            {} -> {}", fmt_ts(result.start_ts), fmt_ts(result.end_ts));
    w!(out, "  Bars processed:    {}", result.bars_processed);
    w!(out, "  Signals:           {}", result.signals);
    w!(out, "  Orders rejected:   {}", result.orders_rejected);
    if !result.complete {
        w!(out, "  Status:            CANCELLED at {}", result.cancelled_at.map(fmt_ts).unwrap_or_default());
    }

    rule(&mut out, "RETURNS");
    w!(out, "  Initial capital:   {:>14.2}", result.initial_capital);
    w!(out, "  Final capital:     {:>14.2}", result.final_capital);
    w!(out, "  Total return:      {:>14.2} ({:.2}%)", m.total_return, m.total_return_pct);
    w!(out, "  Annualized:        {:>13.2}%", m.annualized_return_pct);

    rule(&mut out, "RISK");
    w!(out, "  Max drawdown:      {:>14.2} ({:.2}%)", m.max_drawdown, m.max_drawdown_pct);
    w!(out, "  Sharpe:            {:>14.2}", m.sharpe_ratio);
    w!(out, "  Sortino:           {:>14.2}", m.sortino_ratio);
    w!(out, "  Calmar:            {:>14.2}", m.calmar_ratio);

    rule(&mut out, "TRADES");
    w!(out, "  Total:             {:>14}", m.total_trades);
    w!(out, "  Win rate:          {:>13.1}% ({}W / {}L)", m.win_rate, m.winning_trades, m.losing_trades);
    w!(out, "  Profit factor:     {:>14.2}", m.profit_factor);
    w!(out, "  Avg trade:         {:>14.2}", m.average_trade);
    w!(out, "  Avg win / loss:    {:>14.2} / {:.2}", m.average_win, m.average_loss);
    w!(out, "  Largest win / loss:{:>14.2} / {:.2}", m.largest_win, m.largest_loss);
    w!(out, "  Max streak W / L:  {:>14} / {}", m.max_consecutive_wins, m.max_consecutive_losses);
    w!(out, "  Avg duration:      {:>13.1}h", m.avg_trade_duration_secs / 3600.0);

    rule(&mut out, "COSTS");
    w!(out, "  Commission:        {:>14.2}", m.total_commission);
    w!(out, "  Slippage:          {:>14.2}", m.total_slippage);
    out
}

pub fn trade_log(trades: &[Trade]) -> String {
    let mut out = String::new();
    w!(
        out,
        "{:>4} {:<8} {:<16} {:>10} {:<16} {:>10} {:>8} {:>10} {:>8}  {}",
        "#", "symbol", "entry", "price", "exit", "price", "qty", "net", "ret%", "exit reason"
    );
    w!(out, "{}", "-".repeat(112));
    for t in trades {
        w!(
            out,
            "{:>4} {:<8} {:<16} {:>10.2} {:<16} {:>10.2} {:>8.0} {:>10.2} {:>7.2}%  {}",
            t.id,
            t.symbol,
            fmt_ts(t.entry_ts),
            t.entry_price,
            fmt_ts(t.exit_ts),
            t.exit_price,
            t.quantity,
            t.net_pnl,
            t.return_pct,
            t.exit_reason
        );
    }
    out
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn trades_csv(trades: &[Trade]) -> String {
    let mut out = String::from(
        "id,symbol,side,entry_ts,entry_price,exit_ts,exit_price,quantity,gross_pnl,net_pnl,commission,slippage,return_pct,duration_secs,entry_reason,exit_reason\n",
    );
    for t in trades {
        w!(
            out,
            "{},{},{},{},{:.4},{},{:.4},{},{:.4},{:.4},{:.4},{:.4},{:.4},{},{},{}",
            t.id,
            csv_field(&t.symbol),
            t.side,
            t.entry_ts,
            t.entry_price,
            t.exit_ts,
            t.exit_price,
            t.quantity,
            t.gross_pnl,
            t.net_pnl,
            t.commission,
            t.slippage,
            t.return_pct,
            t.duration_secs,
            csv_field(&t.entry_reason),
            csv_field(&t.exit_reason)
        );
    }
    out
}

pub fn equity_csv(points: &[EquityPoint]) -> String {
    let mut out = String::from("ts,equity,cash,unrealized_pnl\n");
    for p in points {
        w!(out, "{},{:.4},{:.4},{:.4}", p.ts, p.equity, p.cash, p.unrealized_pnl);
    }
    out
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    let mut w = BufWriter::new(fs::File::create(path)?);
    w.write_all(contents.as_bytes())?;
    w.flush()?;
    Ok(())
}

/// Writes `<prefix>_trades.csv`, `<prefix>_equity.csv` and `<prefix>.json`
/// into `dir`, creating it if needed. Returns the written paths.
pub fn export(result: &BacktestResult, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let files = [
        (dir.join(format!("{prefix}_trades.csv")), trades_csv(&result.trades)),
        (dir.join(format!("{prefix}_equity.csv")), equity_csv(&result.equity_curve)),
        (dir.join(format!("{prefix}.json")), serde_json::to_string_pretty(result)?),
    ];
    let mut written = Vec::with_capacity(files.len());
    for (path, contents) in files {
        write_file(&path, &contents)?;
        written.push(path);
    }
    tracing::info!(domain = crate::logging::Domain::System.as_str(), dir = %dir.display(), files = written.len(), "report exported");
    Ok(written)
}

/// Top `n` ranked combinations.
pub fn leaderboard(results: &[OptimizationResult], n: usize, metric: Metric) -> String {
    let mut out = String::new();
    w!(out, "=== TOP {} BY {} ===", n.min(results.len()), metric.as_str().to_uppercase());
    w!(out, "{:>4} {:>10} {:>8} {:>8} {:>9} {:>8}  {}", "rank", "metric", "trades", "win%", "return%", "maxdd%", "params");
    w!(out, "{}", "-".repeat(80));
    for r in results.iter().take(n) {
        match (&r.result, &r.error) {
            (Some(res), _) => {
                let m = &res.metrics;
                w!(
                    out,
                    "{:>4} {:>10.4} {:>8} {:>7.1}% {:>8.2}% {:>7.2}%  {}",
                    r.rank,
                    r.metric_value.unwrap_or_default(),
                    m.total_trades,
                    m.win_rate,
                    m.total_return_pct,
                    m.max_drawdown_pct,
                    r.params
                );
            }
            (None, err) => {
                w!(out, "{:>4} {:>10} {:>44}  {}  ({})", r.rank, "failed", "", r.params, err.as_deref().unwrap_or("no result"));
            }
        }
    }
    let failed = results.iter().filter(|r| !r.is_ok()).count();
    if failed > 0 {
        w!(out, "{} of {} combinations failed", failed, results.len());
    }
    out
}

pub fn walk_forward_report(wf: &WalkForwardResult) -> String {
    let mut out = String::new();
    w!(out, "=== WALK-FORWARD ({}) ===", wf.metric);
    w!(out, "{:>3} {:<11} {:<11} {:>10} {:>10} {:>7} {:>8}  {}", "#", "is start", "oos start", "in-sample", "oos", "ratio", "oos ret%", "params");
    w!(out, "{}", "-".repeat(90));
    for p in &wf.periods {
        let day = |ts: i64| ts_to_datetime(ts).format("%Y-%m-%d").to_string();
        match &p.error {
            None => {
                let oos_ret = p.out_of_sample.as_ref().map(|m| m.total_return_pct).unwrap_or_default();
                let params = p.best_params.as_ref().map(|ps| ps.to_string()).unwrap_or_default();
                w!(
                    out,
                    "{:>3} {:<11} {:<11} {:>10.4} {:>10.4} {:>7.2} {:>7.2}%  {}",
                    p.window.number,
                    day(p.window.is_start),
                    day(p.window.oos_start),
                    p.in_sample_metric,
                    p.out_of_sample_metric,
                    p.performance_ratio,
                    oos_ret,
                    params
                );
            }
            Some(e) => {
                w!(out, "{:>3} {:<11} {:<11} failed: {}", p.window.number, day(p.window.is_start), day(p.window.oos_start), e);
            }
        }
    }
    w!(out);
    w!(out, "  Periods:             {} ({} ok, {} positive OOS)", wf.total_periods, wf.successful_periods, wf.positive_oos_periods);
    w!(out, "  Avg in-sample:       {:.4}", wf.avg_in_sample_metric);
    w!(out, "  Avg out-of-sample:   {:.4}", wf.avg_out_of_sample_metric);
    w!(out, "  Avg ratio:           {:.2}", wf.avg_performance_ratio);
    w!(out, "  Combined OOS return: {:.2}%", wf.combined_oos_return_pct);
    w!(out, "  OOS trades:          {} ({:.1}% win)", wf.combined_oos_trades, wf.combined_oos_win_rate);
    w!(out, "  Avg OOS Sharpe:      {:.2}", wf.avg_oos_sharpe);
    w!(out, "  Max OOS drawdown:    {:.2}%", wf.max_oos_drawdown_pct);
    w!(out, "  Efficiency:          {:.2}{}", wf.efficiency, if wf.overfit { "  [OVERFIT]" } else { "" });
    if wf.cancelled {
        w!(out, "  Cancelled before all periods ran");
    }
    out
}

pub fn monte_carlo_report(mc: &MonteCarloResult) -> String {
    let mut out = String::new();
    w!(out, "=== MONTE CARLO ({} runs x {} trades) ===", mc.simulations, mc.trades_per_simulation);
    if mc.simulations == 0 {
        w!(out, "  No trades to resample");
        return out;
    }
    w!(out, "  Original return:     {:.2}% (max dd {:.2}%)", mc.original_return_pct, mc.original_max_drawdown_pct);
    w!(out, "{:<12} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}", "", "mean", "median", "std", "min", "p5", "p95", "max");
    for (name, s) in [("return %", &mc.returns), ("max dd %", &mc.drawdowns), ("sharpe", &mc.sharpe)] {
        w!(
            out,
            "{:<12} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2}",
            name, s.mean, s.median, s.std_dev, s.min, s.p5, s.p95, s.max
        );
    }
    w!(
        out,
        "  {:.0}% interval:        [{:.2}%, {:.2}%]",
        mc.confidence_level * 100.0,
        mc.return_ci_lower,
        mc.return_ci_upper
    );
    w!(out, "  P(profit):           {:.1}%", mc.probability_of_profit);
    w!(out, "  P(target):           {:.1}%", mc.probability_of_target);
    w!(out, "  Risk of ruin:        {:.1}%", mc.risk_of_ruin);
    out
}
