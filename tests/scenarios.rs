//! End-to-end scenarios through the public API.
//!
//!   1. RSI warm-up on a strictly rising series
//!   2. Order size limit rejection
//!   3. Circuit breaker trip and half-open recovery
//!   4. MA crossover fires once at the true cross
//!   5. 3x3 grid search ranked by Sharpe
//!   6. Deterministic backtest replay

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use tradecore::backtest::{BacktestConfig, BacktestEngine};
use tradecore::cancel::CancelFlag;
use tradecore::data::synthetic_bars;
use tradecore::events::{Bar, OrderRequest, OrderType, Side};
use tradecore::indicators::{Indicator, Rsi};
use tradecore::optimizer::{grid_search, named_factory, GridSearchConfig, Metric};
use tradecore::params::ParamRange;
use tradecore::portfolio::InMemoryPortfolio;
use tradecore::reliability::circuit::ManualClock;
use tradecore::reliability::{CircuitBreaker, CircuitConfig, CircuitState};
use tradecore::risk::{RiskLimits, RiskManager};
use tradecore::strategy::{MaCrossover, Strategy};
use tradecore::{EngineError, ErrorKind};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// 10:00 UTC on a Tuesday, inside default trading hours.
const SESSION_TS: i64 = 1_709_632_800;

fn order(quantity: f64, price: f64) -> OrderRequest {
    OrderRequest {
        id: "o-1".into(),
        strategy_id: "test".into(),
        symbol: "SPY".into(),
        side: Side::Buy,
        quantity,
        price,
        order_type: OrderType::Market,
    }
}

fn hourly_bars(n: usize, seed: u64) -> Vec<Bar> {
    synthetic_bars("SPY", 1_704_067_200, 3600, n, 100.0, seed)
}

// ===========================================================================
// 1. RSI warm-up
// ===========================================================================

#[test]
fn rsi_ready_after_fifteen_rising_closes() {
    let mut rsi = Rsi::new(14);
    for i in 0..25 {
        rsi.update(100.0 + i as f64, i).unwrap();
        let seen = i + 1;
        assert_eq!(rsi.is_ready(), seen >= 15, "ready state wrong after {} closes", seen);
        if seen >= 15 {
            assert_eq!(rsi.value(), 100.0);
        }
    }
}

// ===========================================================================
// 2. Order size limit
// ===========================================================================

#[test]
fn order_above_max_size_is_rejected() {
    let limits = RiskLimits { max_order_size: 500.0, ..RiskLimits::default() };
    let risk = RiskManager::new(limits, Arc::new(InMemoryPortfolio::new(1_000_000.0)));

    let result = risk.check_order(&order(501.0, 10.0), SESSION_TS).unwrap();
    assert!(!result.approved());
    assert!(result.rejections().iter().any(|r| r.contains("Order size 501")));

    let ok = risk.check_order(&order(500.0, 10.0), SESSION_TS).unwrap();
    assert!(ok.rejections().iter().all(|r| !r.contains("Order size")));
}

// ===========================================================================
// 3. Circuit breaker
// ===========================================================================

#[test]
fn breaker_fails_fast_then_half_opens() {
    let clock = Arc::new(ManualClock::new());
    let cfg = CircuitConfig { max_failures: 3, timeout: Duration::from_secs(30), max_requests: 1 };
    let breaker = CircuitBreaker::with_clock("db", cfg, clock.clone());
    let calls = Cell::new(0);

    for _ in 0..3 {
        let r: Result<(), _> = breaker.call(|| {
            calls.set(calls.get() + 1);
            Err(EngineError::TransientInfrastructure("down".into()))
        });
        assert!(r.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let r = breaker.call(|| {
        calls.set(calls.get() + 1);
        Ok(())
    });
    assert_eq!(r.unwrap_err().kind(), ErrorKind::CircuitOpen);
    assert_eq!(calls.get(), 3, "wrapped operation ran while open");

    clock.advance(Duration::from_secs(31));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.call(|| {
        calls.set(calls.get() + 1);
        Ok(())
    })
    .unwrap();
    assert_eq!(calls.get(), 4);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// ===========================================================================
// 4. MA crossover
// ===========================================================================

#[test]
fn crossover_buys_once_at_bar_22() {
    let mut closes: Vec<f64> = (1..=21).map(|i| 100.0 - i as f64).collect();
    closes.extend(std::iter::repeat(150.0).take(10));

    let mut s = MaCrossover::new("ma", vec!["SPY".into()], 5, 20).unwrap();
    s.initialize().unwrap();
    let mut signals = Vec::new();
    for (i, c) in closes.iter().enumerate() {
        let bar = Bar::new("SPY", SESSION_TS + i as i64 * 60, *c, *c, *c, *c, 1000.0);
        if let Some(sig) = s.on_market_data(&bar).unwrap() {
            signals.push((i + 1, sig.side));
        }
    }
    assert_eq!(signals, vec![(22, Side::Buy)]);
}

// ===========================================================================
// 5. Grid search
// ===========================================================================

#[test]
fn three_by_three_grid_yields_nine_ranked_results() {
    let bars = hourly_bars(24 * 30, 11);
    let cfg = GridSearchConfig::new(
        BacktestConfig::default(),
        vec![ParamRange::int_range("short_period", 5, 15, 5), ParamRange::int_range("long_period", 20, 40, 10)],
        Metric::SharpeRatio,
    );
    let sweep = grid_search(&cfg, &bars, named_factory("ma_crossover", vec!["SPY".into()]), &CancelFlag::new()).unwrap();
    assert!(sweep.is_complete());
    assert_eq!((sweep.total, sweep.attempted), (9, 9));
    let results = sweep.results;

    assert_eq!(results.len(), 9);
    assert!(results.iter().all(|r| r.is_ok()));
    let values: Vec<f64> = results.iter().map(|r| r.metric_value.unwrap()).collect();
    assert!(values.windows(2).all(|w| w[0] >= w[1]), "not sorted: {:?}", values);
    assert_eq!(results.iter().map(|r| r.rank).collect::<Vec<_>>(), (1..=9).collect::<Vec<_>>());
}

// ===========================================================================
// 6. Deterministic replay
// ===========================================================================

#[test]
fn same_backtest_twice_is_identical() {
    let bars = hourly_bars(24 * 20, 5);
    let engine = BacktestEngine::new(BacktestConfig::default()).unwrap();
    let factory = named_factory("rsi", vec!["SPY".into()]);
    let params = Default::default();

    let a = engine.run(factory(&params).unwrap().as_mut(), &bars, &CancelFlag::new()).unwrap();
    let b = engine.run(factory(&params).unwrap().as_mut(), &bars, &CancelFlag::new()).unwrap();
    assert_eq!(a.trades.len(), b.trades.len());
    assert_eq!(a.equity_curve.len(), b.equity_curve.len());
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn backtest_without_matching_bars_is_configuration_error() {
    let bars = synthetic_bars("QQQ", 1_704_067_200, 3600, 50, 100.0, 1);
    let engine = BacktestEngine::new(BacktestConfig::default()).unwrap();
    let mut s = MaCrossover::new("ma", vec!["SPY".into()], 5, 20).unwrap();
    let err = engine.run(&mut s, &bars, &CancelFlag::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SimulationConfiguration);
}
