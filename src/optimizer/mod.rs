//! Parameter search over backtests: exhaustive grid search, walk-forward
//! validation and Monte Carlo resampling of trade sequences.
//!
//! Grid runs are independent, so they are spread over a bounded pool of
//! scoped threads. Each run gets a fresh strategy from the factory and its
//! own event bus; nothing is shared between runs except the read-only bars.

pub mod monte_carlo;
pub mod walk_forward;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::backtest::{BacktestConfig, BacktestEngine, BacktestResult, PerformanceMetrics};
use crate::cancel::CancelFlag;
use crate::error::{EngineError, Result};
use crate::events::Bar;
use crate::logging::Domain;
use crate::params::{cartesian_product, ParamRange, ParameterSet};
use crate::strategy::{self, Strategy};

pub use monte_carlo::{monte_carlo, DistributionStats, MonteCarloConfig, MonteCarloResult};
pub use walk_forward::{generate_periods, walk_forward, PeriodWindow, WalkForwardConfig, WalkForwardPeriod, WalkForwardResult};

/// Objective to maximise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    SharpeRatio,
    SortinoRatio,
    TotalReturn,
    ProfitFactor,
    CalmarRatio,
    WinRate,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::SharpeRatio => "sharpe_ratio",
            Metric::SortinoRatio => "sortino_ratio",
            Metric::TotalReturn => "total_return",
            Metric::ProfitFactor => "profit_factor",
            Metric::CalmarRatio => "calmar_ratio",
            Metric::WinRate => "win_rate",
        }
    }

    /// Unknown names fall back to the Sharpe ratio.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "sortino" | "sortino_ratio" => Metric::SortinoRatio,
            "return" | "total_return" => Metric::TotalReturn,
            "profit_factor" => Metric::ProfitFactor,
            "calmar" | "calmar_ratio" => Metric::CalmarRatio,
            "win_rate" => Metric::WinRate,
            "sharpe" | "sharpe_ratio" => Metric::SharpeRatio,
            other => {
                tracing::warn!(domain = Domain::Optimizer.as_str(), metric = other, "unknown metric, using sharpe_ratio");
                Metric::SharpeRatio
            }
        }
    }

    pub fn extract(&self, m: &PerformanceMetrics) -> f64 {
        match self {
            Metric::SharpeRatio => m.sharpe_ratio,
            Metric::SortinoRatio => m.sortino_ratio,
            Metric::TotalReturn => m.total_return_pct,
            Metric::ProfitFactor => m.profit_factor,
            Metric::CalmarRatio => m.calmar_ratio,
            Metric::WinRate => m.win_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GridSearchConfig {
    pub backtest: BacktestConfig,
    pub ranges: Vec<ParamRange>,
    pub metric: Metric,
    /// 0 means one worker per CPU.
    pub workers: usize,
    /// 0 means no cap; otherwise the product is truncated in order.
    pub max_combinations: usize,
}

impl GridSearchConfig {
    pub fn new(backtest: BacktestConfig, ranges: Vec<ParamRange>, metric: Metric) -> Self {
        Self { backtest, ranges, metric, workers: 0, max_combinations: 0 }
    }

    fn worker_count(&self, jobs: usize) -> usize {
        let w = if self.workers == 0 { num_cpus::get() } else { self.workers };
        w.clamp(1, jobs.max(1))
    }
}

/// One combination's outcome. Failed runs carry `error` and no metric.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub index: usize,
    pub rank: usize,
    pub params: ParameterSet,
    pub metric_value: Option<f64>,
    pub result: Option<BacktestResult>,
    pub error: Option<String>,
}

impl OptimizationResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Ranked outcome of one sweep.
///
/// `attempted < total` exactly when the sweep was cancelled before every
/// combination was picked up; runs interrupted mid-backtest are in `results`
/// with an error.
#[derive(Debug, Clone, Serialize)]
pub struct GridSearchResult {
    pub results: Vec<OptimizationResult>,
    pub total: usize,
    pub attempted: usize,
    pub cancelled: bool,
}

impl GridSearchResult {
    pub fn is_complete(&self) -> bool {
        !self.cancelled
    }

    /// Highest-ranked successful combination.
    pub fn best(&self) -> Option<&OptimizationResult> {
        self.results.iter().find(|r| r.is_ok())
    }
}

const CANCELLED_RUN: &str = "cancelled before completion";

/// Factory for the built-in strategies by name.
pub fn named_factory(name: &str, symbols: Vec<String>) -> impl Fn(&ParameterSet) -> Result<Box<dyn Strategy>> + Sync {
    let name = name.to_string();
    move |params| strategy::build(&name, params, &symbols)
}

/// Best first; failures last; ties keep combination order.
pub fn rank_results(results: &mut [OptimizationResult]) {
    results.sort_by(|a, b| match (a.metric_value, b.metric_value) {
        (Some(x), Some(y)) => y.total_cmp(&x).then(a.index.cmp(&b.index)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.index.cmp(&b.index),
    });
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }
}

fn run_one<F>(engine: &BacktestEngine, factory: &F, metric: Metric, index: usize, params: ParameterSet, bars: &[Bar], cancel: &CancelFlag) -> OptimizationResult
where
    F: Fn(&ParameterSet) -> Result<Box<dyn Strategy>> + Sync,
{
    let outcome = factory(&params).and_then(|mut s| engine.run(s.as_mut(), bars, cancel));
    match outcome {
        Ok(result) if !result.complete => OptimizationResult {
            index,
            rank: 0,
            params,
            metric_value: None,
            result: None,
            error: Some(CANCELLED_RUN.to_string()),
        },
        Ok(result) => {
            let v = metric.extract(&result.metrics);
            let v = if v.is_nan() { f64::NEG_INFINITY } else { v };
            tracing::debug!(
                domain = Domain::Optimizer.as_str(),
                combination = index + 1,
                params = %params,
                metric = v,
                trades = result.metrics.total_trades,
                "combination done"
            );
            OptimizationResult { index, rank: 0, params, metric_value: Some(v), result: Some(result), error: None }
        }
        Err(e) => {
            tracing::warn!(
                domain = Domain::Optimizer.as_str(),
                combination = index + 1,
                params = %params,
                kind = e.kind().as_str(),
                error = %e,
                "combination failed"
            );
            OptimizationResult { index, rank: 0, params, metric_value: None, result: None, error: Some(e.to_string()) }
        }
    }
}

/// Exhaustive search over the Cartesian product of `config.ranges`.
///
/// Returns every attempted combination ranked by `config.metric`. When
/// `cancel` fires, workers stop picking up new combinations and the ranked
/// partial set comes back with `cancelled` set.
pub fn grid_search<F>(config: &GridSearchConfig, bars: &[Bar], factory: F, cancel: &CancelFlag) -> Result<GridSearchResult>
where
    F: Fn(&ParameterSet) -> Result<Box<dyn Strategy>> + Sync,
{
    if let Some(r) = config.ranges.iter().find(|r| r.values.is_empty()) {
        return Err(EngineError::SimulationConfiguration(format!("parameter range '{}' has no values", r.name)));
    }
    let engine = BacktestEngine::new(config.backtest.clone())?;
    let mut combos = cartesian_product(&config.ranges);
    if config.max_combinations > 0 && combos.len() > config.max_combinations {
        tracing::warn!(
            domain = Domain::Optimizer.as_str(),
            total = combos.len(),
            max = config.max_combinations,
            "limiting combinations to max"
        );
        combos.truncate(config.max_combinations);
    }

    let total = combos.len();
    let workers = config.worker_count(total);
    tracing::info!(
        domain = Domain::Optimizer.as_str(),
        combinations = total,
        workers,
        metric = config.metric.as_str(),
        "grid search started"
    );

    let next = AtomicUsize::new(0);
    let done = AtomicUsize::new(0);
    let results = Mutex::new(Vec::with_capacity(total));
    let progress_every = (total / 10).max(1);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if cancel.is_cancelled() {
                    break;
                }
                let i = next.fetch_add(1, Ordering::SeqCst);
                let Some(params) = combos.get(i) else {
                    break;
                };
                let r = run_one(&engine, &factory, config.metric, i, params.clone(), bars, cancel);
                results.lock().unwrap_or_else(|e| e.into_inner()).push(r);
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                if n % progress_every == 0 {
                    tracing::info!(domain = Domain::Optimizer.as_str(), done = n, total, "grid search progress");
                }
            });
        }
    });

    let mut results = results.into_inner().unwrap_or_else(|e| e.into_inner());
    rank_results(&mut results);
    let attempted = results.len();
    let interrupted = results.iter().any(|r| r.result.is_none() && r.error.as_deref() == Some(CANCELLED_RUN));
    let cancelled = attempted < total || interrupted;
    if cancelled {
        tracing::warn!(domain = Domain::Optimizer.as_str(), attempted, total, "grid search cancelled");
    }
    if let Some(best) = results.first() {
        tracing::info!(
            domain = Domain::Optimizer.as_str(),
            tested = results.len(),
            best_params = %best.params,
            best_metric = best.metric_value.unwrap_or(f64::NAN),
            "grid search finished"
        );
    }
    Ok(GridSearchResult { results, total, attempted, cancelled })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_bars;
    use crate::params::ParamValue;

    fn bars() -> Vec<Bar> {
        synthetic_bars("SPY", 1_709_596_800, 3600, 240, 100.0, 3)
    }

    fn ok(index: usize, v: f64) -> OptimizationResult {
        OptimizationResult { index, rank: 0, params: ParameterSet::new(), metric_value: Some(v), result: None, error: None }
    }

    fn failed(index: usize) -> OptimizationResult {
        OptimizationResult { error: Some("boom".into()), metric_value: None, ..ok(index, 0.0) }
    }

    #[test]
    fn test_rank_orders_desc_failures_last_ties_by_index() {
        let mut rs = vec![failed(0), ok(1, 1.0), ok(2, 3.0), ok(3, 1.0), failed(4)];
        rank_results(&mut rs);
        let order: Vec<usize> = rs.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![2, 1, 3, 0, 4]);
        assert_eq!(rs.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_grid_search_records_failures_inline() {
        let cfg = GridSearchConfig {
            workers: 2,
            ..GridSearchConfig::new(
                BacktestConfig::default(),
                vec![
                    ParamRange::values("short_period", vec![ParamValue::Int(5), ParamValue::Int(40)]),
                    ParamRange::values("long_period", vec![ParamValue::Int(20)]),
                ],
                Metric::TotalReturn,
            )
        };
        let sweep = grid_search(&cfg, &bars(), named_factory("ma_crossover", vec!["SPY".into()]), &CancelFlag::new()).unwrap();
        assert!(sweep.is_complete());
        let results = sweep.results;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_eq!(results[1].index, 1);
        assert!(results[1].error.as_deref().unwrap_or("").contains("short period"));
    }

    #[test]
    fn test_max_combinations_truncates() {
        let cfg = GridSearchConfig {
            max_combinations: 3,
            workers: 1,
            ..GridSearchConfig::new(
                BacktestConfig::default(),
                vec![ParamRange::int_range("short_period", 2, 8, 1), ParamRange::values("long_period", vec![ParamValue::Int(20)])],
                Metric::SharpeRatio,
            )
        };
        let sweep = grid_search(&cfg, &bars(), named_factory("ma_crossover", vec!["SPY".into()]), &CancelFlag::new()).unwrap();
        assert_eq!((sweep.total, sweep.attempted, sweep.cancelled), (3, 3, false));
        let results = sweep.results;
        assert_eq!(results.len(), 3);
        let mut idx: Vec<usize> = results.iter().map(|r| r.index).collect();
        idx.sort();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[test]
    fn test_cancelled_before_start_is_flagged() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let cfg = GridSearchConfig::new(BacktestConfig::default(), vec![ParamRange::int_range("period", 10, 20, 5)], Metric::SharpeRatio);
        let sweep = grid_search(&cfg, &bars(), named_factory("rsi", vec!["SPY".into()]), &cancel).unwrap();
        assert!(sweep.results.is_empty());
        assert!(sweep.cancelled);
        assert!(!sweep.is_complete());
        assert_eq!((sweep.total, sweep.attempted), (3, 0));
        assert!(sweep.best().is_none());
    }

    #[test]
    fn test_cancel_mid_sweep_keeps_partial_ranked_set() {
        let cancel = CancelFlag::new();
        let cfg = GridSearchConfig {
            workers: 1,
            ..GridSearchConfig::new(BacktestConfig::default(), vec![ParamRange::int_range("period", 5, 25, 5)], Metric::SharpeRatio)
        };
        let calls = AtomicUsize::new(0);
        let build = named_factory("rsi", vec!["SPY".into()]);
        let factory = |p: &ParameterSet| {
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                cancel.cancel();
            }
            build(p)
        };
        let sweep = grid_search(&cfg, &bars(), factory, &cancel).unwrap();
        assert!(sweep.cancelled);
        assert_eq!(sweep.total, 5);
        assert_eq!(sweep.attempted, 2);
        assert!(sweep.results[0].is_ok());
        assert!(!sweep.results[1].is_ok());
        assert_eq!(sweep.results[1].index, 1);
    }

    #[test]
    fn test_empty_range_is_configuration_error() {
        let cfg = GridSearchConfig::new(BacktestConfig::default(), vec![ParamRange::values("period", vec![])], Metric::SharpeRatio);
        let err = grid_search(&cfg, &bars(), named_factory("rsi", vec!["SPY".into()]), &CancelFlag::new()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SimulationConfiguration);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!(Metric::parse("sortino"), Metric::SortinoRatio);
        assert_eq!(Metric::parse("TOTAL_RETURN"), Metric::TotalReturn);
        assert_eq!(Metric::parse("nonsense"), Metric::SharpeRatio);
    }
}
