//! Simulated order execution: long-only, one position at a time.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::BacktestConfig;
use crate::error::{EngineError, Result};
use crate::events::{ts_to_datetime, OrderFilled, Side};
use crate::logging::{self, Domain};

/// One closed round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub symbol: String,
    pub side: String,
    pub entry_ts: i64,
    pub entry_price: f64,
    pub exit_ts: i64,
    pub exit_price: f64,
    pub quantity: f64,
    /// Price move only, before commission.
    pub gross_pnl: f64,
    /// After entry and exit commission. Slippage is already in the prices.
    pub net_pnl: f64,
    pub commission: f64,
    pub slippage: f64,
    pub return_pct: f64,
    pub duration_secs: i64,
    pub entry_reason: String,
    pub exit_reason: String,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.net_pnl > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub strategy_id: String,
    pub entry_ts: i64,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_reason: String,
    pub entry_commission: f64,
    pub entry_slippage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub starting_equity: f64,
    pub ending_equity: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub commission: f64,
    pub slippage: f64,
    pub halted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: i64,
    pub equity: f64,
    pub cash: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug)]
struct Day {
    date: NaiveDate,
    starting_equity: f64,
    pnl: f64,
    first_trade: usize,
    halted: bool,
}

/// Everything the executor accumulated over a run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub cash: f64,
    pub trades: Vec<Trade>,
    pub daily_stats: Vec<DailyStats>,
    pub equity_curve: Vec<EquityPoint>,
}

#[derive(Debug)]
pub struct Executor {
    commission: f64,
    commission_pct: f64,
    slippage: f64,
    max_position_size: f64,
    max_daily_loss: f64,
    max_daily_loss_pct: f64,
    cash: f64,
    position: Option<OpenPosition>,
    last_price: f64,
    next_order: u64,
    trades: Vec<Trade>,
    day: Option<Day>,
    daily_stats: Vec<DailyStats>,
    equity_curve: Vec<EquityPoint>,
}

impl Executor {
    pub fn new(config: &BacktestConfig) -> Self {
        Self {
            commission: config.commission,
            commission_pct: config.commission_pct,
            slippage: config.slippage,
            max_position_size: config.max_position_size,
            max_daily_loss: config.max_daily_loss,
            max_daily_loss_pct: config.max_daily_loss_pct,
            cash: config.initial_capital,
            position: None,
            last_price: 0.0,
            next_order: 0,
            trades: Vec::new(),
            day: None,
            daily_stats: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        self.position.as_ref()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity(&self) -> f64 {
        self.cash + self.position.as_ref().map_or(0.0, |p| p.quantity * self.last_price)
    }

    fn slipped(&self, price: f64, side: Side) -> f64 {
        match side {
            Side::Buy => price * (1.0 + self.slippage),
            Side::Sell => price * (1.0 - self.slippage),
        }
    }

    fn commission_for(&self, price: f64, quantity: f64) -> f64 {
        self.commission + price * quantity * self.commission_pct
    }

    fn order_id(&mut self) -> String {
        self.next_order += 1;
        format!("bt-{}", self.next_order)
    }

    /// Roll the trading day if `ts` starts a new one and report whether new
    /// entries are halted by the daily loss limits.
    pub fn begin_bar(&mut self, ts: i64) -> bool {
        let date = ts_to_datetime(ts).date_naive();
        if self.day.as_ref().map(|d| d.date) != Some(date) {
            self.close_day();
            self.day = Some(Day {
                date,
                starting_equity: self.equity(),
                pnl: 0.0,
                first_trade: self.trades.len(),
                halted: false,
            });
        }
        let (max_loss, max_loss_pct) = (self.max_daily_loss, self.max_daily_loss_pct);
        let Some(day) = self.day.as_mut() else {
            return false;
        };
        if !day.halted {
            let over_dollar = max_loss > 0.0 && day.pnl < -max_loss;
            let over_pct = max_loss_pct > 0.0 && day.starting_equity > 0.0 && -day.pnl / day.starting_equity > max_loss_pct;
            if over_dollar || over_pct {
                day.halted = true;
                tracing::warn!(
                    domain = Domain::Risk.as_str(),
                    date = %day.date,
                    daily_pnl = day.pnl,
                    "daily loss limit hit, no new entries for the rest of the day"
                );
            }
        }
        day.halted
    }

    /// Open a long position. `Ok(None)` when the order is skipped (already
    /// long, insufficient capital).
    pub fn buy(&mut self, strategy_id: &str, symbol: &str, price: f64, quantity: f64, ts: i64, reason: &str) -> Result<Option<OrderFilled>> {
        if !(quantity > 0.0) {
            return Err(EngineError::validation(format!("quantity must be positive, got {}", quantity)));
        }
        if !(price > 0.0) {
            return Err(EngineError::validation(format!("price must be positive, got {}", price)));
        }
        if self.position.is_some() {
            tracing::debug!(domain = Domain::Exec.as_str(), symbol, "already in a position, buy ignored");
            return Ok(None);
        }
        let quantity = if self.max_position_size > 0.0 { quantity.min(self.max_position_size) } else { quantity };
        let exec_price = self.slipped(price, Side::Buy);
        let commission = self.commission_for(exec_price, quantity);
        let total = exec_price * quantity + commission;
        if total > self.cash {
            tracing::warn!(
                domain = Domain::Exec.as_str(),
                symbol,
                required = total,
                available = self.cash,
                "insufficient capital, buy skipped"
            );
            return Ok(None);
        }

        self.cash -= total;
        self.last_price = price;
        self.position = Some(OpenPosition {
            symbol: symbol.to_string(),
            strategy_id: strategy_id.to_string(),
            entry_ts: ts,
            entry_price: exec_price,
            quantity,
            entry_reason: reason.to_string(),
            entry_commission: commission,
            entry_slippage: (exec_price - price) * quantity,
        });
        logging::log_fill(strategy_id, symbol, Side::Buy.as_str(), quantity, exec_price, ts);
        Ok(Some(OrderFilled {
            order_id: self.order_id(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            quantity,
            price: exec_price,
            commission,
            ts,
        }))
    }

    /// Close the open position. `Ok(None)` when flat.
    pub fn sell(&mut self, price: f64, ts: i64, reason: &str) -> Result<Option<(OrderFilled, Trade)>> {
        if !(price > 0.0) {
            return Err(EngineError::validation(format!("price must be positive, got {}", price)));
        }
        let Some(pos) = self.position.take() else {
            tracing::debug!(domain = Domain::Exec.as_str(), "no position, sell ignored");
            return Ok(None);
        };
        let exec_price = self.slipped(price, Side::Sell);
        let commission = self.commission_for(exec_price, pos.quantity);
        let proceeds = exec_price * pos.quantity - commission;
        let cost_basis = pos.entry_price * pos.quantity;
        let gross = (exec_price - pos.entry_price) * pos.quantity;
        let net = gross - commission - pos.entry_commission;

        self.cash += proceeds;
        self.last_price = price;
        let trade = Trade {
            id: self.trades.len() as u64 + 1,
            symbol: pos.symbol.clone(),
            side: "LONG".to_string(),
            entry_ts: pos.entry_ts,
            entry_price: pos.entry_price,
            exit_ts: ts,
            exit_price: exec_price,
            quantity: pos.quantity,
            gross_pnl: gross,
            net_pnl: net,
            commission: commission + pos.entry_commission,
            slippage: pos.entry_slippage + (price - exec_price) * pos.quantity,
            return_pct: if cost_basis > 0.0 { net / cost_basis * 100.0 } else { 0.0 },
            duration_secs: ts - pos.entry_ts,
            entry_reason: pos.entry_reason.clone(),
            exit_reason: reason.to_string(),
        };
        if let Some(day) = self.day.as_mut() {
            day.pnl += net;
        }
        self.trades.push(trade.clone());
        logging::log_fill(&pos.strategy_id, &pos.symbol, Side::Sell.as_str(), pos.quantity, exec_price, ts);
        let fill = OrderFilled {
            order_id: self.order_id(),
            strategy_id: pos.strategy_id,
            symbol: pos.symbol,
            side: Side::Sell,
            quantity: pos.quantity,
            price: exec_price,
            commission,
            ts,
        };
        Ok(Some((fill, trade)))
    }

    /// Record an equity point at the bar close.
    pub fn mark(&mut self, ts: i64, price: f64) {
        self.last_price = price;
        let unrealized_pnl = self
            .position
            .as_ref()
            .map_or(0.0, |p| (price - p.entry_price) * p.quantity);
        self.equity_curve.push(EquityPoint { ts, equity: self.equity(), cash: self.cash, unrealized_pnl });
    }

    fn close_day(&mut self) {
        let Some(day) = self.day.take() else {
            return;
        };
        let closed = &self.trades[day.first_trade..];
        let ending = self.equity();
        self.daily_stats.push(DailyStats {
            date: day.date,
            starting_equity: day.starting_equity,
            ending_equity: ending,
            pnl: day.pnl,
            pnl_pct: if day.starting_equity > 0.0 { day.pnl / day.starting_equity * 100.0 } else { 0.0 },
            trades: closed.len(),
            wins: closed.iter().filter(|t| t.is_win()).count(),
            losses: closed.iter().filter(|t| !t.is_win()).count(),
            commission: closed.iter().map(|t| t.commission).sum(),
            slippage: closed.iter().map(|t| t.slippage).sum(),
            halted: day.halted,
        });
    }

    pub fn finish(mut self) -> ExecutionReport {
        self.close_day();
        ExecutionReport {
            cash: self.cash,
            trades: self.trades,
            daily_stats: self.daily_stats,
            equity_curve: self.equity_curve,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BacktestConfig {
        BacktestConfig { commission: 1.0, slippage: 0.001, initial_capital: 100_000.0, ..Default::default() }
    }

    #[test]
    fn test_round_trip_costs() {
        let mut ex = Executor::new(&config());
        ex.begin_bar(0);
        let fill = ex.buy("s", "SPY", 100.0, 100.0, 0, "entry").unwrap().unwrap();
        assert!((fill.price - 100.1).abs() < 1e-9);
        assert!((ex.cash() - (100_000.0 - 10_010.0 - 1.0)).abs() < 1e-6);

        let (_, trade) = ex.sell(110.0, 3600, "exit").unwrap().unwrap();
        assert!((trade.exit_price - 109.89).abs() < 1e-9);
        assert!((trade.gross_pnl - (109.89 - 100.1) * 100.0).abs() < 1e-6);
        assert!((trade.net_pnl - (trade.gross_pnl - 2.0)).abs() < 1e-9);
        assert!((trade.slippage - 21.0).abs() < 1e-6);
        assert_eq!(trade.duration_secs, 3600);
        assert!((ex.cash() - (100_000.0 + trade.net_pnl)).abs() < 1e-6);
    }

    #[test]
    fn test_skips_duplicate_entry_and_flat_exit() {
        let mut ex = Executor::new(&config());
        assert!(ex.sell(100.0, 0, "x").unwrap().is_none());
        assert!(ex.buy("s", "SPY", 100.0, 10.0, 0, "a").unwrap().is_some());
        assert!(ex.buy("s", "SPY", 100.0, 10.0, 1, "b").unwrap().is_none());
        assert!(ex.buy("s", "SPY", 0.0, 10.0, 1, "b").is_err());
    }

    #[test]
    fn test_insufficient_capital_and_size_cap() {
        let cfg = BacktestConfig { initial_capital: 1_000.0, max_position_size: 5.0, ..config() };
        let mut ex = Executor::new(&cfg);
        let fill = ex.buy("s", "SPY", 100.0, 100.0, 0, "a").unwrap().unwrap();
        assert_eq!(fill.quantity, 5.0);
        ex.sell(100.0, 1, "x").unwrap();
        assert!(ex.buy("s", "SPY", 1_000.0, 5.0, 2, "a").unwrap().is_none());
    }

    #[test]
    fn test_daily_loss_halts_entries_until_next_day() {
        let cfg = BacktestConfig { max_daily_loss: 100.0, max_daily_loss_pct: 0.0, slippage: 0.0, commission: 0.0, ..config() };
        let mut ex = Executor::new(&cfg);
        assert!(!ex.begin_bar(0));
        ex.buy("s", "SPY", 100.0, 10.0, 0, "a").unwrap();
        ex.sell(80.0, 60, "stop").unwrap();
        assert!(ex.begin_bar(120));
        assert!(!ex.begin_bar(86_400));
        let report = ex.finish();
        assert_eq!(report.daily_stats.len(), 2);
        assert!(report.daily_stats[0].halted);
        assert!((report.daily_stats[0].pnl + 200.0).abs() < 1e-9);
        assert_eq!(report.daily_stats[0].losses, 1);
    }
}
