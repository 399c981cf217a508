//! Deterministic historical replay of a strategy.
//!
//! Bars are published on a private event bus and consumed through the same
//! `StrategyContext` path the live runner uses. Signals are drained after
//! every bar, checked by the risk manager against a simulated portfolio and
//! executed by the `Executor`.
//!
//! Fill model: by default a signal raised on bar N fills at the open of
//! bar N+1, which keeps the strategy from trading on a close it has only
//! just observed. `FillModel::SameBarClose` fills at the signal bar's close.
//! No wall-clock time is read anywhere in a run, so identical inputs give
//! identical results (see `BacktestResult::fingerprint`).

pub mod executor;
pub mod metrics;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bus::EventBus;
use crate::cancel::CancelFlag;
use crate::error::{EngineError, Result};
use crate::events::{Bar, Event, EventType, OrderRequest, Side, Signal};
use crate::logging::Domain;
use crate::portfolio::InMemoryPortfolio;
use crate::risk::{RiskLimits, RiskManager};
use crate::strategy::{Strategy, StrategyContext};

pub use executor::{DailyStats, EquityPoint, ExecutionReport, Executor, OpenPosition, Trade};
pub use metrics::PerformanceMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillModel {
    #[default]
    NextBarOpen,
    SameBarClose,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestConfig {
    pub symbol: String,
    /// Inclusive bounds in epoch seconds; `None` leaves the side open.
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
    pub initial_capital: f64,
    /// Fixed dollars per fill.
    pub commission: f64,
    /// Fraction of notional per fill, on top of `commission`.
    pub commission_pct: f64,
    /// Fraction of price, always against us.
    pub slippage: f64,
    pub max_position_size: f64,
    pub max_daily_loss: f64,
    pub max_daily_loss_pct: f64,
    pub risk_limits: RiskLimits,
    pub fill_model: FillModel,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: "SPY".to_string(),
            start_ts: None,
            end_ts: None,
            initial_capital: 100_000.0,
            commission: 1.0,
            commission_pct: 0.0,
            slippage: 0.001,
            max_position_size: 1000.0,
            max_daily_loss: 2_000.0,
            max_daily_loss_pct: 0.02,
            risk_limits: RiskLimits::backtest(),
            fill_model: FillModel::NextBarOpen,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(EngineError::SimulationConfiguration(msg));
        if self.symbol.trim().is_empty() {
            return fail("symbol is required".into());
        }
        if !(self.initial_capital > 0.0) {
            return fail(format!("initial capital must be positive, got {}", self.initial_capital));
        }
        if let (Some(s), Some(e)) = (self.start_ts, self.end_ts) {
            if s >= e {
                return fail(format!("start {} must be before end {}", s, e));
            }
        }
        if self.commission < 0.0 || self.commission_pct < 0.0 || self.slippage < 0.0 {
            return fail("commission and slippage must be non-negative".into());
        }
        if self.max_position_size < 0.0 || self.max_daily_loss < 0.0 || self.max_daily_loss_pct < 0.0 {
            return fail("position and loss limits must be non-negative".into());
        }
        Ok(())
    }

    pub fn with_range(mut self, start_ts: i64, end_ts: i64) -> Self {
        self.start_ts = Some(start_ts);
        self.end_ts = Some(end_ts);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub strategy_id: String,
    pub config: BacktestConfig,
    pub start_ts: i64,
    pub end_ts: i64,
    pub bars_processed: usize,
    pub signals: usize,
    pub orders_rejected: usize,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub metrics: PerformanceMetrics,
    pub trades: Vec<Trade>,
    pub daily_stats: Vec<DailyStats>,
    pub equity_curve: Vec<EquityPoint>,
    /// False when the run was cancelled before the last bar.
    pub complete: bool,
    pub cancelled_at: Option<i64>,
}

impl BacktestResult {
    /// SHA-256 over the canonical JSON form of the result.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

pub struct BacktestEngine {
    config: BacktestConfig,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Bars for the configured symbol inside the configured range, by time.
    pub fn select_bars(&self, bars: &[Bar]) -> Vec<Bar> {
        let mut selected: Vec<Bar> = bars
            .iter()
            .filter(|b| b.symbol == self.config.symbol)
            .filter(|b| self.config.start_ts.map_or(true, |s| b.ts >= s))
            .filter(|b| self.config.end_ts.map_or(true, |e| b.ts <= e))
            .cloned()
            .collect();
        selected.sort_by_key(|b| b.ts);
        selected
    }

    pub fn run<S: Strategy + ?Sized>(&self, strategy: &mut S, bars: &[Bar], cancel: &CancelFlag) -> Result<BacktestResult> {
        let cfg = &self.config;
        let bars = self.select_bars(bars);
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return Err(EngineError::SimulationConfiguration(format!(
                "no bars for {} in the requested range",
                cfg.symbol
            )));
        };
        let (start_ts, end_ts) = (first.ts, last.ts);
        tracing::info!(
            domain = Domain::Strategy.as_str(),
            strategy_id = strategy.id(),
            symbol = %cfg.symbol,
            bars = bars.len(),
            start_ts,
            end_ts,
            "backtest started"
        );

        strategy.initialize()?;
        let bus = EventBus::new(bars.len().clamp(16, 4096));
        let mut market = bus.subscribe(EventType::MarketData);
        let mut signal_rx = bus.subscribe(EventType::Signal);
        let mut ctx = StrategyContext::new(strategy.id(), strategy.symbols(), bus.clone());

        let portfolio = Arc::new(InMemoryPortfolio::new(cfg.initial_capital));
        let mut sim = Simulation {
            strategy_id: strategy.id().to_string(),
            executor: Executor::new(cfg),
            portfolio: portfolio.clone(),
            risk: RiskManager::new(cfg.risk_limits.clone(), portfolio),
            signals: 0,
            orders_rejected: 0,
        };

        let mut pending: Vec<Signal> = Vec::new();
        let mut processed = 0usize;
        let mut cancelled_at = None;
        let mut last_bar: Option<&Bar> = None;

        for bar in &bars {
            if cancel.is_cancelled() {
                cancelled_at = Some(bar.ts);
                tracing::warn!(domain = Domain::Strategy.as_str(), ts = bar.ts, processed, "backtest cancelled");
                break;
            }
            let halted = sim.executor.begin_bar(bar.ts);

            for signal in pending.drain(..) {
                sim.execute(strategy, &mut ctx, &signal, bar.open, bar.ts, halted)?;
            }

            bus.publish(Event::MarketData(bar.clone()));
            for event in market.drain() {
                if let Event::MarketData(b) = event {
                    ctx.handle_market_data(strategy, &b)?;
                }
            }
            for event in signal_rx.drain() {
                let Event::Signal(signal) = event else { continue };
                sim.signals += 1;
                match cfg.fill_model {
                    FillModel::SameBarClose => sim.execute(strategy, &mut ctx, &signal, bar.close, bar.ts, halted)?,
                    FillModel::NextBarOpen => pending.push(signal),
                }
            }

            sim.executor.mark(bar.ts, bar.close);
            sim.portfolio.mark(&bar.symbol, bar.close);
            processed += 1;
            last_bar = Some(bar);
        }

        if !pending.is_empty() {
            tracing::debug!(domain = Domain::Strategy.as_str(), count = pending.len(), "signals on the final bar not filled");
        }
        if let Some(bar) = last_bar {
            if let Some((fill, _)) = sim.executor.sell(bar.close, bar.ts, "Backtest end - force close")? {
                sim.portfolio.apply_fill(&fill);
                ctx.handle_fill(strategy, &fill)?;
                sim.executor.mark(bar.ts, bar.close);
            }
        }

        let report = sim.executor.finish();
        let metrics = metrics::calculate(
            &report.trades,
            &report.daily_stats,
            &report.equity_curve,
            cfg.initial_capital,
            report.cash,
        );
        tracing::info!(
            domain = Domain::Strategy.as_str(),
            strategy_id = strategy.id(),
            final_capital = report.cash,
            total_return_pct = metrics.total_return_pct,
            trades = metrics.total_trades,
            sharpe = metrics.sharpe_ratio,
            max_drawdown_pct = metrics.max_drawdown_pct,
            complete = cancelled_at.is_none(),
            "backtest finished"
        );

        Ok(BacktestResult {
            strategy_id: strategy.id().to_string(),
            config: cfg.clone(),
            start_ts,
            end_ts,
            bars_processed: processed,
            signals: sim.signals,
            orders_rejected: sim.orders_rejected,
            initial_capital: cfg.initial_capital,
            final_capital: report.cash,
            metrics,
            trades: report.trades,
            daily_stats: report.daily_stats,
            equity_curve: report.equity_curve,
            complete: cancelled_at.is_none(),
            cancelled_at,
        })
    }
}

struct Simulation {
    strategy_id: String,
    executor: Executor,
    portfolio: Arc<InMemoryPortfolio>,
    risk: RiskManager,
    signals: usize,
    orders_rejected: usize,
}

impl Simulation {
    /// Entries go through the risk pipeline; exits are always allowed.
    fn execute<S: Strategy + ?Sized>(
        &mut self,
        strategy: &mut S,
        ctx: &mut StrategyContext,
        signal: &Signal,
        price: f64,
        ts: i64,
        halted: bool,
    ) -> Result<()> {
        let fill = match signal.side {
            Side::Buy => {
                if halted {
                    tracing::debug!(domain = Domain::Risk.as_str(), ts, "entry skipped, daily loss limit");
                    return Ok(());
                }
                if self.executor.position().is_some() {
                    return Ok(());
                }
                let mut order = OrderRequest::from_signal(format!("bt-req-{}", ts), signal);
                order.price = price;
                let check = self.risk.check_order(&order, ts)?;
                if !check.approved() {
                    self.orders_rejected += 1;
                    tracing::info!(
                        domain = Domain::Risk.as_str(),
                        ts,
                        reasons = %check.rejections().join("; "),
                        "entry rejected by risk checks"
                    );
                    return Ok(());
                }
                self.executor
                    .buy(&self.strategy_id, &signal.symbol, price, signal.quantity, ts, &signal.reason)?
            }
            Side::Sell => self.executor.sell(price, ts, &signal.reason)?.map(|(fill, _)| fill),
        };
        let Some(fill) = fill else {
            return Ok(());
        };
        let realized = self.portfolio.apply_fill(&fill);
        self.risk.record_order(ts);
        if fill.side == Side::Sell {
            self.risk.update_daily_pnl(realized - fill.commission, ts);
        }
        ctx.handle_fill(strategy, &fill)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::MaCrossover;

    /// Buys on the first bar, sells on the third.
    struct Scripted {
        symbols: Vec<String>,
        n: usize,
    }

    impl Strategy for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }
        fn name(&self) -> &str {
            "Scripted"
        }
        fn symbols(&self) -> &[String] {
            &self.symbols
        }
        fn on_market_data(&mut self, bar: &Bar) -> Result<Option<Signal>> {
            self.n += 1;
            Ok(match self.n {
                1 => Some(Signal::new("scripted", bar, Side::Buy, 1.0, 10.0, "in".into())),
                3 => Some(Signal::new("scripted", bar, Side::Sell, 1.0, 10.0, "out".into())),
                _ => None,
            })
        }
    }

    fn scripted() -> Scripted {
        Scripted { symbols: vec!["SPY".into()], n: 0 }
    }

    fn bars() -> Vec<Bar> {
        (0..5)
            .map(|i| {
                let o = 100.0 + i as f64;
                Bar::new("SPY", 1_709_647_200 + i * 60, o, o + 1.0, o - 1.0, o + 0.5, 1000.0)
            })
            .collect()
    }

    fn frictionless() -> BacktestConfig {
        BacktestConfig { commission: 0.0, slippage: 0.0, ..Default::default() }
    }

    #[test]
    fn test_next_bar_open_fills() {
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let r = engine.run(&mut scripted(), &bars(), &CancelFlag::new()).unwrap();
        assert_eq!(r.trades.len(), 1);
        let t = &r.trades[0];
        assert_eq!(t.entry_price, 101.0);
        assert_eq!(t.exit_price, 103.0);
        assert!((t.net_pnl - 20.0).abs() < 1e-9);
        assert!(r.complete);
        assert_eq!(r.bars_processed, 5);
    }

    #[test]
    fn test_same_bar_close_fills() {
        let cfg = BacktestConfig { fill_model: FillModel::SameBarClose, ..frictionless() };
        let r = BacktestEngine::new(cfg).unwrap().run(&mut scripted(), &bars(), &CancelFlag::new()).unwrap();
        let t = &r.trades[0];
        assert_eq!(t.entry_price, 100.5);
        assert_eq!(t.exit_price, 102.5);
    }

    #[test]
    fn test_config_validation() {
        assert!(BacktestEngine::new(BacktestConfig { initial_capital: 0.0, ..Default::default() }).is_err());
        assert!(BacktestEngine::new(BacktestConfig::default().with_range(10, 10)).is_err());
        let err = BacktestEngine::new(BacktestConfig { symbol: "".into(), ..Default::default() }).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::SimulationConfiguration);
    }

    #[test]
    fn test_no_bars_in_range() {
        let engine = BacktestEngine::new(frictionless().with_range(0, 10)).unwrap();
        let err = engine.run(&mut scripted(), &bars(), &CancelFlag::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SimulationConfiguration);
    }

    #[test]
    fn test_cancelled_run_is_partial() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let r = engine.run(&mut scripted(), &bars(), &cancel).unwrap();
        assert!(!r.complete);
        assert_eq!(r.bars_processed, 0);
        assert_eq!(r.cancelled_at, Some(1_709_647_200));
    }

    #[test]
    fn test_force_close_on_last_bar() {
        struct BuyOnce(Vec<String>, bool);
        impl Strategy for BuyOnce {
            fn id(&self) -> &str {
                "once"
            }
            fn name(&self) -> &str {
                "Once"
            }
            fn symbols(&self) -> &[String] {
                &self.0
            }
            fn on_market_data(&mut self, bar: &Bar) -> Result<Option<Signal>> {
                if self.1 {
                    return Ok(None);
                }
                self.1 = true;
                Ok(Some(Signal::new("once", bar, Side::Buy, 1.0, 10.0, "in".into())))
            }
        }
        let engine = BacktestEngine::new(frictionless()).unwrap();
        let r = engine.run(&mut BuyOnce(vec!["SPY".into()], false), &bars(), &CancelFlag::new()).unwrap();
        assert_eq!(r.trades.len(), 1);
        assert_eq!(r.trades[0].exit_reason, "Backtest end - force close");
        assert_eq!(r.trades[0].exit_price, 104.5);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let bars = crate::data::synthetic_bars("SPY", 1_709_596_800, 3600, 300, 100.0, 11);
        let engine = BacktestEngine::new(BacktestConfig::default()).unwrap();
        let run = || {
            let mut s = MaCrossover::new("mac", vec!["SPY".into()], 5, 20).unwrap();
            engine.run(&mut s, &bars, &CancelFlag::new()).unwrap().fingerprint()
        };
        assert_eq!(run(), run());
    }
}
