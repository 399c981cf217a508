//! Walk-forward validation.
//!
//! The timeline is cut into (in-sample, out-of-sample) windows. Each
//! in-sample window is grid-searched, and the winning parameters are then
//! run unseen on the following out-of-sample window. A strategy whose
//! out-of-sample metric keeps less than half of its in-sample metric is
//! flagged as overfit.

use serde::Serialize;

use super::{grid_search, GridSearchConfig};
use crate::backtest::{BacktestEngine, PerformanceMetrics};
use crate::cancel::CancelFlag;
use crate::error::{EngineError, Result};
use crate::events::Bar;
use crate::logging::Domain;
use crate::params::ParameterSet;
use crate::strategy::Strategy;

const DAY_SECS: i64 = 86_400;
const OVERFIT_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct WalkForwardConfig {
    /// Search setup; its backtest range (if any) bounds the whole walk.
    pub grid: GridSearchConfig,
    pub in_sample_days: u32,
    pub out_of_sample_days: u32,
    /// Advance per period; 0 means `out_of_sample_days`.
    pub step_days: u32,
    /// Anchored windows keep the in-sample start fixed and grow the end.
    pub anchored: bool,
}

impl WalkForwardConfig {
    pub fn new(grid: GridSearchConfig, in_sample_days: u32, out_of_sample_days: u32) -> Self {
        Self { grid, in_sample_days, out_of_sample_days, step_days: 0, anchored: false }
    }

    fn validate(&self) -> Result<()> {
        if self.in_sample_days == 0 || self.out_of_sample_days == 0 {
            return Err(EngineError::SimulationConfiguration(
                "in-sample and out-of-sample windows must be at least one day".to_string(),
            ));
        }
        Ok(())
    }

    fn step_secs(&self) -> i64 {
        let step = if self.step_days == 0 { self.out_of_sample_days } else { self.step_days };
        i64::from(step) * DAY_SECS
    }
}

/// Half-open window bounds: in-sample `[is_start, is_end)`, out-of-sample
/// `[oos_start, oos_end)` with `oos_start == is_end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodWindow {
    pub number: usize,
    pub is_start: i64,
    pub is_end: i64,
    pub oos_start: i64,
    pub oos_end: i64,
}

/// Windows whose out-of-sample end fits inside `[start_ts, end_ts]`.
pub fn generate_periods(start_ts: i64, end_ts: i64, config: &WalkForwardConfig) -> Vec<PeriodWindow> {
    let mut periods = Vec::new();
    if config.in_sample_days == 0 || config.out_of_sample_days == 0 {
        return periods;
    }
    let is_len = i64::from(config.in_sample_days) * DAY_SECS;
    let oos_len = i64::from(config.out_of_sample_days) * DAY_SECS;
    let step = config.step_secs();
    let limit = end_ts.saturating_add(1);

    loop {
        let k = periods.len() as i64;
        let (is_start, is_end) = if config.anchored {
            (start_ts, start_ts + is_len + k * step)
        } else {
            (start_ts + k * step, start_ts + k * step + is_len)
        };
        let oos_end = is_end + oos_len;
        if oos_end > limit {
            break;
        }
        periods.push(PeriodWindow { number: periods.len() + 1, is_start, is_end, oos_start: is_end, oos_end });
    }
    periods
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardPeriod {
    pub window: PeriodWindow,
    pub best_params: Option<ParameterSet>,
    pub combinations_tested: usize,
    pub in_sample_metric: f64,
    pub out_of_sample_metric: f64,
    /// Out-of-sample metric over in-sample metric; 0 when in-sample is 0.
    pub performance_ratio: f64,
    pub in_sample: Option<PerformanceMetrics>,
    pub out_of_sample: Option<PerformanceMetrics>,
    pub error: Option<String>,
}

impl WalkForwardPeriod {
    fn failed(window: PeriodWindow, combinations_tested: usize, error: String) -> Self {
        Self {
            window,
            best_params: None,
            combinations_tested,
            in_sample_metric: 0.0,
            out_of_sample_metric: 0.0,
            performance_ratio: 0.0,
            in_sample: None,
            out_of_sample: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WalkForwardResult {
    pub metric: String,
    pub periods: Vec<WalkForwardPeriod>,
    pub total_periods: usize,
    pub successful_periods: usize,
    pub avg_in_sample_metric: f64,
    pub avg_out_of_sample_metric: f64,
    pub avg_performance_ratio: f64,
    pub positive_oos_periods: usize,
    pub combined_oos_return_pct: f64,
    pub combined_oos_trades: usize,
    pub combined_oos_win_rate: f64,
    pub avg_oos_sharpe: f64,
    pub max_oos_drawdown_pct: f64,
    /// Average out-of-sample metric over average in-sample metric.
    pub efficiency: f64,
    pub overfit: bool,
    pub cancelled: bool,
}

impl WalkForwardResult {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    fn aggregate(&mut self) {
        self.total_periods = self.periods.len();
        let ok: Vec<&WalkForwardPeriod> = self.periods.iter().filter(|p| p.is_ok()).collect();
        self.successful_periods = ok.len();
        if ok.is_empty() {
            return;
        }
        let n = ok.len() as f64;
        self.avg_in_sample_metric = ok.iter().map(|p| p.in_sample_metric).sum::<f64>() / n;
        self.avg_out_of_sample_metric = ok.iter().map(|p| p.out_of_sample_metric).sum::<f64>() / n;
        self.avg_performance_ratio = ok.iter().map(|p| p.performance_ratio).sum::<f64>() / n;

        let oos: Vec<&PerformanceMetrics> = ok.iter().filter_map(|p| p.out_of_sample.as_ref()).collect();
        self.positive_oos_periods = oos.iter().filter(|m| m.total_return > 0.0).count();
        self.combined_oos_return_pct = oos.iter().map(|m| m.total_return_pct).sum();
        self.combined_oos_trades = oos.iter().map(|m| m.total_trades).sum();
        let wins: usize = oos.iter().map(|m| m.winning_trades).sum();
        self.combined_oos_win_rate = if self.combined_oos_trades > 0 {
            wins as f64 / self.combined_oos_trades as f64 * 100.0
        } else {
            0.0
        };
        if !oos.is_empty() {
            self.avg_oos_sharpe = oos.iter().map(|m| m.sharpe_ratio).sum::<f64>() / oos.len() as f64;
        }
        self.max_oos_drawdown_pct = oos.iter().map(|m| m.max_drawdown_pct).fold(0.0, f64::max);

        self.efficiency = if self.avg_in_sample_metric != 0.0 {
            self.avg_out_of_sample_metric / self.avg_in_sample_metric
        } else {
            0.0
        };
        self.overfit = self.efficiency < OVERFIT_RATIO;
    }
}

fn ratio(oos: f64, is: f64) -> f64 {
    if is == 0.0 {
        0.0
    } else {
        oos / is
    }
}

fn run_period<F>(config: &WalkForwardConfig, window: PeriodWindow, bars: &[Bar], factory: &F, cancel: &CancelFlag) -> WalkForwardPeriod
where
    F: Fn(&ParameterSet) -> Result<Box<dyn Strategy>> + Sync,
{
    let metric = config.grid.metric;
    let mut grid = config.grid.clone();
    grid.backtest = grid.backtest.with_range(window.is_start, window.is_end - 1);

    let sweep = match grid_search(&grid, bars, factory, cancel) {
        Ok(r) => r,
        Err(e) => return WalkForwardPeriod::failed(window, 0, format!("in-sample search failed: {e}")),
    };
    let tested = sweep.attempted;
    if sweep.cancelled {
        return WalkForwardPeriod::failed(window, tested, "in-sample search cancelled".to_string());
    }
    let Some(best) = sweep.results.into_iter().find(|r| r.is_ok()) else {
        return WalkForwardPeriod::failed(window, tested, "no in-sample combination succeeded".to_string());
    };
    let Some(is_result) = best.result else {
        return WalkForwardPeriod::failed(window, tested, "best combination has no result".to_string());
    };
    let is_metric = metric.extract(&is_result.metrics);

    let oos_cfg = config.grid.backtest.clone().with_range(window.oos_start, window.oos_end - 1);
    let oos = BacktestEngine::new(oos_cfg).and_then(|engine| {
        let mut strategy = factory(&best.params)?;
        engine.run(strategy.as_mut(), bars, cancel)
    });
    let oos_result = match oos {
        Ok(r) if r.complete => r,
        Ok(_) => return WalkForwardPeriod::failed(window, tested, "out-of-sample run cancelled".to_string()),
        Err(e) => return WalkForwardPeriod::failed(window, tested, format!("out-of-sample run failed: {e}")),
    };
    let oos_metric = metric.extract(&oos_result.metrics);

    tracing::info!(
        domain = Domain::Optimizer.as_str(),
        period = window.number,
        params = %best.params,
        in_sample = is_metric,
        out_of_sample = oos_metric,
        "walk-forward period done"
    );

    WalkForwardPeriod {
        window,
        best_params: Some(best.params),
        combinations_tested: tested,
        in_sample_metric: is_metric,
        out_of_sample_metric: oos_metric,
        performance_ratio: ratio(oos_metric, is_metric),
        in_sample: Some(is_result.metrics),
        out_of_sample: Some(oos_result.metrics),
        error: None,
    }
}

/// Runs every window in order. Failed windows are kept with their error
/// and left out of the aggregates.
pub fn walk_forward<F>(config: &WalkForwardConfig, bars: &[Bar], factory: F, cancel: &CancelFlag) -> Result<WalkForwardResult>
where
    F: Fn(&ParameterSet) -> Result<Box<dyn Strategy>> + Sync,
{
    config.validate()?;
    let engine = BacktestEngine::new(config.grid.backtest.clone())?;
    let selected = engine.select_bars(bars);
    let (Some(first), Some(last)) = (selected.first(), selected.last()) else {
        return Err(EngineError::SimulationConfiguration(format!(
            "no bars for {} in the requested range",
            config.grid.backtest.symbol
        )));
    };
    let start = config.grid.backtest.start_ts.unwrap_or(first.ts);
    let end = config.grid.backtest.end_ts.unwrap_or(last.ts);

    let windows = generate_periods(start, end, config);
    if windows.is_empty() {
        return Err(EngineError::SimulationConfiguration(format!(
            "range too short for {} in-sample + {} out-of-sample days",
            config.in_sample_days, config.out_of_sample_days
        )));
    }
    tracing::info!(
        domain = Domain::Optimizer.as_str(),
        periods = windows.len(),
        anchored = config.anchored,
        "walk-forward started"
    );

    let mut result = WalkForwardResult { metric: config.grid.metric.as_str().to_string(), ..Default::default() };
    for window in windows {
        if cancel.is_cancelled() {
            result.cancelled = true;
            tracing::warn!(domain = Domain::Optimizer.as_str(), period = window.number, "walk-forward cancelled");
            break;
        }
        result.periods.push(run_period(config, window, &selected, &factory, cancel));
    }
    result.aggregate();

    tracing::info!(
        domain = Domain::Optimizer.as_str(),
        periods = result.total_periods,
        successful = result.successful_periods,
        efficiency = result.efficiency,
        overfit = result.overfit,
        "walk-forward finished"
    );
    Ok(result)
}
