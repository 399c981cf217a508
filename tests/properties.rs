//! Property tests for indicator, risk, strategy and optimizer invariants.

use std::sync::Arc;

use proptest::prelude::*;
use tradecore::backtest::BacktestConfig;
use tradecore::events::{Bar, OrderRequest, OrderType, Side};
use tradecore::indicators::{BollingerBands, Ema, Indicator, Rsi, Sma};
use tradecore::optimizer::{generate_periods, rank_results, GridSearchConfig, Metric, OptimizationResult, WalkForwardConfig};
use tradecore::params::ParameterSet;
use tradecore::portfolio::InMemoryPortfolio;
use tradecore::risk::{RiskLimits, RiskManager};
use tradecore::strategy::MaCrossover;

const SESSION_TS: i64 = 1_709_632_800;

fn prices() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(1.0f64..1000.0, 1..120)
}

// The proptest prelude owns the name `Strategy` in this file.
fn feed(s: &mut MaCrossover, closes: &[f64]) -> Vec<Side> {
    tradecore::strategy::Strategy::initialize(s).unwrap();
    let mut out = Vec::new();
    for (i, c) in closes.iter().enumerate() {
        let bar = Bar::new("SPY", SESSION_TS + i as i64 * 60, *c, *c, *c, *c, 1000.0);
        if let Some(sig) = tradecore::strategy::Strategy::on_market_data(s, &bar).unwrap() {
            out.push(sig.side);
        }
    }
    out
}

proptest! {
    #[test]
    fn warm_up_is_exact(period in 2usize..40, series in prices()) {
        let mut sma = Sma::new(period);
        let mut ema = Ema::new(period);
        let mut bb = BollingerBands::new(period, 2.0);
        let mut rsi = Rsi::new(period);
        for (i, p) in series.iter().enumerate() {
            sma.update(*p, i as i64).unwrap();
            ema.update(*p, i as i64).unwrap();
            bb.update(*p, i as i64).unwrap();
            rsi.update(*p, i as i64).unwrap();
            let seen = i + 1;
            prop_assert_eq!(sma.is_ready(), seen >= period);
            prop_assert_eq!(ema.is_ready(), seen >= period);
            prop_assert_eq!(bb.is_ready(), seen >= period);
            prop_assert_eq!(rsi.is_ready(), seen > period);
        }
    }

    #[test]
    fn rsi_stays_in_range(period in 2usize..30, series in prices()) {
        let mut rsi = Rsi::new(period);
        for (i, p) in series.iter().enumerate() {
            rsi.update(*p, i as i64).unwrap();
            let v = rsi.value();
            prop_assert!((0.0..=100.0).contains(&v), "rsi {} out of range", v);
        }
    }

    #[test]
    fn rsi_extremes(period in 2usize..20, start in 10.0f64..500.0, step in 0.01f64..5.0) {
        let mut up = Rsi::new(period);
        let mut down = Rsi::new(period);
        for i in 0..=period {
            up.update(start + step * i as f64, i as i64).unwrap();
            down.update(start + 1000.0 - step * i as f64, i as i64).unwrap();
        }
        prop_assert_eq!(up.value(), 100.0);
        prop_assert_eq!(down.value(), 0.0);
    }

    #[test]
    fn bollinger_bands_are_ordered(period in 2usize..30, k in 0.0f64..5.0, series in prices()) {
        let mut bb = BollingerBands::with_raw_multiplier(period, k);
        for (i, p) in series.iter().enumerate() {
            bb.update(*p, i as i64).unwrap();
            if bb.is_ready() {
                prop_assert!(bb.upper() >= bb.middle());
                prop_assert!(bb.middle() >= bb.lower());
            }
        }
    }

    #[test]
    fn crossover_signals_alternate(short in 1usize..8, extra in 1usize..20, series in prices()) {
        let mut s = MaCrossover::new("ma", vec!["SPY".into()], short, short + extra).unwrap();
        let sides = feed(&mut s, &series);
        for w in sides.windows(2) {
            prop_assert_ne!(w[0], w[1]);
        }
    }

    #[test]
    fn approved_iff_no_rejections(qty in 1.0f64..2000.0, price in 1.0f64..500.0, max_value in 1_000.0f64..50_000.0) {
        let limits = RiskLimits { max_order_value: max_value, ..RiskLimits::default() };
        let risk = RiskManager::new(limits, Arc::new(InMemoryPortfolio::new(100_000.0)));
        let order = OrderRequest {
            id: "o".into(),
            strategy_id: "p".into(),
            symbol: "SPY".into(),
            side: Side::Buy,
            quantity: qty,
            price,
            order_type: OrderType::Market,
        };
        let r = risk.check_order(&order, SESSION_TS).unwrap();
        prop_assert_eq!(r.approved(), r.rejections().is_empty());
        if qty * price > max_value {
            prop_assert!(!r.approved());
        }
    }

    #[test]
    fn walk_forward_windows_never_overlap(is_days in 1u32..60, oos_days in 1u32..30, step in 0u32..30, anchored in any::<bool>(), span in 1i64..400) {
        let grid = GridSearchConfig::new(BacktestConfig::default(), vec![], Metric::SharpeRatio);
        let cfg = WalkForwardConfig { step_days: step, anchored, ..WalkForwardConfig::new(grid, is_days, oos_days) };
        let start = 1_704_067_200;
        let end = start + span * 86_400;
        for p in generate_periods(start, end, &cfg) {
            prop_assert!(p.is_start < p.is_end);
            prop_assert_eq!(p.oos_start, p.is_end);
            prop_assert!(p.oos_start < p.oos_end);
            prop_assert!(p.oos_end <= end + 1);
        }
    }

    #[test]
    fn ranking_puts_best_first(values in prop::collection::vec(prop::option::of(-50.0f64..50.0), 1..40)) {
        let mut results: Vec<OptimizationResult> = values
            .iter()
            .enumerate()
            .map(|(index, v)| OptimizationResult {
                index,
                rank: 0,
                params: ParameterSet::new(),
                metric_value: *v,
                result: None,
                error: if v.is_none() { Some("failed".into()) } else { None },
            })
            .collect();
        rank_results(&mut results);
        if let Some(best) = results[0].metric_value {
            prop_assert!(results.iter().filter_map(|r| r.metric_value).all(|v| v <= best));
        }
        let first_failed = results.iter().position(|r| r.metric_value.is_none()).unwrap_or(results.len());
        prop_assert!(results[first_failed..].iter().all(|r| r.metric_value.is_none()));
    }
}
