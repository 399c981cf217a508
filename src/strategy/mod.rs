//! Strategy engine: the `Strategy` trait, the shared per-strategy context and
//! the async runner that drives a strategy from the event bus.
//!
//! Strategies are plain synchronous state machines. Everything that touches
//! the bus (subscriptions, stale-bar guard, signal publication) lives in
//! `StrategyContext`, so the backtest can drive the same code path
//! deterministically without spawning tasks.

mod bollinger;
mod crossover;
mod opening_range;
mod rsi;
mod vwap;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::{AuditLogger, StrategyAction};
use crate::bus::{EventBus, Subscription};
use crate::error::{EngineError, Result};
use crate::events::{Bar, Event, EventType, OrderFilled, Side, Signal};
use crate::logging::{self, Domain};
use crate::params::ParameterSet;

pub use bollinger::BollingerBounce;
pub use crossover::MaCrossover;
pub use opening_range::OpeningRange;
pub use rsi::RsiMeanReversion;
pub use vwap::VwapBounce;

/// Default order quantity for every built-in strategy.
pub const DEFAULT_QUANTITY: f64 = 100.0;

pub trait Strategy: Send {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn symbols(&self) -> &[String];

    /// Allocate per-symbol state. Called once before the first bar.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_market_data(&mut self, bar: &Bar) -> Result<Option<Signal>>;

    fn on_order_filled(&mut self, _fill: &OrderFilled) -> Result<()> {
        Ok(())
    }
}

/// Names accepted by [`build`].
pub const STRATEGY_NAMES: [&str; 5] = ["ma_crossover", "rsi", "bollinger", "vwap", "opening_range"];

/// Construct a built-in strategy from a parameter set.
///
/// Unknown names and inconsistent parameters are `SimulationConfiguration`
/// errors, which the optimizer records against the failing combination.
pub fn build(name: &str, params: &ParameterSet, symbols: &[String]) -> Result<Box<dyn Strategy>> {
    let symbols = symbols.to_vec();
    let quantity = params.float("quantity", DEFAULT_QUANTITY);
    if quantity <= 0.0 {
        return Err(EngineError::SimulationConfiguration(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }
    let strategy: Box<dyn Strategy> = match name {
        "ma_crossover" => Box::new(
            MaCrossover::new(name, symbols, params.period("short_period", 10), params.period("long_period", 30))?
                .with_quantity(quantity),
        ),
        "rsi" => Box::new(
            RsiMeanReversion::new(
                name,
                symbols,
                params.period("period", 14),
                params.float("oversold", 30.0),
                params.float("overbought", 70.0),
            )?
            .with_quantity(quantity),
        ),
        "bollinger" => Box::new(
            BollingerBounce::new(name, symbols, params.period("period", 20), params.float("std_dev", 2.0))
                .with_quantity(quantity),
        ),
        "vwap" => Box::new(
            VwapBounce::new(
                name,
                symbols,
                params.float("tolerance", 0.3),
                params.float("target", 1.0),
                params.period("ema_period", 20),
            )
            .with_quantity(quantity),
        ),
        "opening_range" => Box::new(
            OpeningRange::new(name, symbols, params.int("range_minutes", 15), params.period("atr_period", 14))
                .with_quantity(quantity),
        ),
        other => {
            return Err(EngineError::SimulationConfiguration(format!(
                "unknown strategy '{}', expected one of {}",
                other,
                STRATEGY_NAMES.join(", ")
            )))
        }
    };
    Ok(strategy)
}

// =============================================================================
// Context
// =============================================================================

/// Bus-facing state shared by the live runner and the backtest.
#[derive(Debug)]
pub struct StrategyContext {
    strategy_id: String,
    bus: EventBus,
    symbols: Vec<String>,
    last_ts: HashMap<String, i64>,
    signals_published: u64,
    stale_rejected: u64,
}

impl StrategyContext {
    pub fn new(strategy_id: &str, symbols: &[String], bus: EventBus) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            bus,
            symbols: symbols.to_vec(),
            last_ts: HashMap::new(),
            signals_published: 0,
            stale_rejected: 0,
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn tracks(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }

    pub fn signals_published(&self) -> u64 {
        self.signals_published
    }

    pub fn stale_rejected(&self) -> u64 {
        self.stale_rejected
    }

    /// Stale-bar guard. `Ok(false)` means skip the bar quietly (untracked
    /// symbol or duplicate timestamp); an older bar is a `Validation` error.
    pub fn accept_bar(&mut self, bar: &Bar) -> Result<bool> {
        if !self.tracks(&bar.symbol) {
            return Ok(false);
        }
        bar.validate()?;
        if let Some(&last) = self.last_ts.get(&bar.symbol) {
            if bar.ts < last {
                self.stale_rejected += 1;
                logging::log_stale_bar(&self.strategy_id, &bar.symbol, bar.ts, last);
                return Err(EngineError::validation(format!(
                    "stale bar for {}: ts {} older than last seen {}",
                    bar.symbol, bar.ts, last
                )));
            }
            if bar.ts == last {
                tracing::debug!(
                    domain = Domain::Market.as_str(),
                    strategy_id = %self.strategy_id,
                    symbol = %bar.symbol,
                    ts = bar.ts,
                    "duplicate bar skipped"
                );
                return Ok(false);
            }
        }
        self.last_ts.insert(bar.symbol.clone(), bar.ts);
        Ok(true)
    }

    pub fn publish_signal(&mut self, signal: Signal) -> usize {
        logging::log_signal(
            &signal.strategy_id,
            &signal.symbol,
            signal.side.as_str(),
            signal.confidence,
            &signal.reason,
        );
        self.signals_published += 1;
        self.bus.publish(Event::Signal(signal))
    }

    /// Guard the bar, run the strategy and publish whatever it emits.
    pub fn handle_market_data<S: Strategy + ?Sized>(&mut self, strategy: &mut S, bar: &Bar) -> Result<Option<Signal>> {
        if !self.accept_bar(bar)? {
            return Ok(None);
        }
        let signal = strategy.on_market_data(bar)?;
        if let Some(sig) = &signal {
            self.publish_signal(sig.clone());
        }
        Ok(signal)
    }

    /// Forward a fill to the strategy if it belongs to it. Returns whether it did.
    pub fn handle_fill<S: Strategy + ?Sized>(&mut self, strategy: &mut S, fill: &OrderFilled) -> Result<bool> {
        if fill.strategy_id != self.strategy_id {
            return Ok(false);
        }
        strategy.on_order_filled(fill)?;
        Ok(true)
    }
}

// =============================================================================
// Runner
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Initialized,
    Running,
    Stopped,
}

impl RunnerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerState::Created => "CREATED",
            RunnerState::Initialized => "INITIALIZED",
            RunnerState::Running => "RUNNING",
            RunnerState::Stopped => "STOPPED",
        }
    }
}

type LoopOutput = (Box<dyn Strategy>, StrategyContext);

/// Drives one strategy from the bus on its own tokio task.
pub struct StrategyRunner {
    state: RunnerState,
    strategy_id: String,
    name: String,
    bus: EventBus,
    strategy: Option<Box<dyn Strategy>>,
    context: Option<StrategyContext>,
    subscriptions: Option<(Subscription, Subscription)>,
    subscription_ids: Vec<u64>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<LoopOutput>>,
    audit: Option<Arc<AuditLogger>>,
}

impl StrategyRunner {
    pub fn new(strategy: Box<dyn Strategy>, bus: EventBus) -> Self {
        Self {
            state: RunnerState::Created,
            strategy_id: strategy.id().to_string(),
            name: strategy.name().to_string(),
            bus,
            strategy: Some(strategy),
            context: None,
            subscriptions: None,
            subscription_ids: Vec::new(),
            stop_tx: None,
            task: None,
            audit: None,
        }
    }

    /// Record `strategy_start` / `strategy_stop` for every successful transition.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn audit_action(&self, action: StrategyAction) {
        let Some(audit) = &self.audit else { return };
        if let Err(e) = audit.log_strategy_action(&self.strategy_id, action, None) {
            tracing::warn!(domain = Domain::Audit.as_str(), strategy_id = %self.strategy_id, error = %e, "audit write failed");
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// The context, once the loop has been stopped (or before it started).
    pub fn context(&self) -> Option<&StrategyContext> {
        self.context.as_ref()
    }

    fn illegal(&self, op: &str) -> EngineError {
        EngineError::validation(format!(
            "cannot {} strategy {} in state {}",
            op,
            self.strategy_id,
            self.state.as_str()
        ))
    }

    pub fn initialize(&mut self) -> Result<()> {
        if self.state != RunnerState::Created {
            return Err(self.illegal("initialize"));
        }
        let strategy = self.strategy.as_mut().ok_or_else(|| EngineError::validation("strategy missing"))?;
        strategy.initialize()?;
        let context = StrategyContext::new(&self.strategy_id, strategy.symbols(), self.bus.clone());
        let market = self.bus.subscribe(EventType::MarketData);
        let fills = self.bus.subscribe(EventType::OrderFilled);
        self.subscription_ids = vec![market.id, fills.id];
        self.subscriptions = Some((market, fills));
        self.context = Some(context);
        self.state = RunnerState::Initialized;
        tracing::info!(domain = Domain::Strategy.as_str(), strategy_id = %self.strategy_id, name = %self.name, "strategy initialized");
        Ok(())
    }

    /// Spawn the event loop. Must be called from inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.state != RunnerState::Initialized {
            return Err(self.illegal("start"));
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::validation(format!("no tokio runtime: {}", e)))?;
        let (strategy, context, (market, fills)) = match (self.strategy.take(), self.context.take(), self.subscriptions.take()) {
            (Some(s), Some(c), Some(subs)) => (s, c, subs),
            _ => return Err(EngineError::validation("runner resources missing")),
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        self.task = Some(handle.spawn(run_loop(strategy, context, market, fills, stop_rx)));
        self.stop_tx = Some(stop_tx);
        self.state = RunnerState::Running;
        self.bus.publish(Event::status(&self.strategy_id, RunnerState::Running.as_str(), "strategy started"));
        self.audit_action(StrategyAction::Start);
        tracing::info!(domain = Domain::Strategy.as_str(), strategy_id = %self.strategy_id, "strategy running");
        Ok(())
    }

    /// Signal the loop to exit, wait for it and release the subscriptions.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            RunnerState::Stopped => return Err(self.illegal("stop")),
            RunnerState::Running => {
                if let Some(tx) = self.stop_tx.take() {
                    let _ = tx.send(true);
                }
                if let Some(task) = self.task.take() {
                    let (strategy, context) = task.await.map_err(|e| {
                        EngineError::TransientInfrastructure(format!("strategy task failed: {}", e))
                    })?;
                    self.strategy = Some(strategy);
                    self.context = Some(context);
                }
            }
            RunnerState::Initialized | RunnerState::Created => {
                self.subscriptions = None;
            }
        }
        for id in self.subscription_ids.drain(..) {
            self.bus.unsubscribe(id);
        }
        self.state = RunnerState::Stopped;
        self.bus.publish(Event::status(&self.strategy_id, RunnerState::Stopped.as_str(), "strategy stopped"));
        self.audit_action(StrategyAction::Stop);
        tracing::info!(domain = Domain::Strategy.as_str(), strategy_id = %self.strategy_id, "strategy stopped");
        Ok(())
    }
}

async fn run_loop(
    mut strategy: Box<dyn Strategy>,
    mut context: StrategyContext,
    mut market: Subscription,
    mut fills: Subscription,
    mut stop_rx: watch::Receiver<bool>,
) -> LoopOutput {
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            event = market.recv() => match event {
                Some(Event::MarketData(bar)) => {
                    if let Err(e) = context.handle_market_data(strategy.as_mut(), &bar) {
                        tracing::warn!(
                            domain = Domain::Strategy.as_str(),
                            strategy_id = %context.strategy_id(),
                            kind = e.kind().as_str(),
                            error = %e,
                            "market data handling failed"
                        );
                    }
                }
                Some(_) => {}
                None => break,
            },
            event = fills.recv() => match event {
                Some(Event::OrderFilled(fill)) => {
                    if let Err(e) = context.handle_fill(strategy.as_mut(), &fill) {
                        tracing::warn!(
                            domain = Domain::Strategy.as_str(),
                            strategy_id = %context.strategy_id(),
                            error = %e,
                            "fill handling failed"
                        );
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }
    (strategy, context)
}

/// Per-symbol long/flat flag with the entry price.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Holding {
    pub long: bool,
    pub entry_price: f64,
}

impl Holding {
    pub fn open(&mut self, price: f64) {
        self.long = true;
        self.entry_price = price;
    }

    pub fn close(&mut self) {
        self.long = false;
        self.entry_price = 0.0;
    }

    /// Sync from a fill of our own order.
    pub fn apply_fill(&mut self, fill: &OrderFilled) {
        match fill.side {
            Side::Buy => self.open(fill.price),
            Side::Sell => self.close(),
        }
    }
}
