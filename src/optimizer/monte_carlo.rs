//! Monte Carlo resampling of a finished run's trade sequence.
//!
//! Each simulation replays the realized net P&Ls in a random order (or a
//! bootstrap sample) from the initial capital and records the final return,
//! the worst drawdown and a per-trade Sharpe ratio. Seeded, so a given
//! config and trade list always yields the same distribution.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::backtest::metrics::sharpe;
use crate::backtest::Trade;
use crate::error::{EngineError, Result};
use crate::logging::Domain;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    pub simulations: usize,
    pub seed: u64,
    /// Two-sided level for the final-return interval, in (0, 1).
    pub confidence_level: f64,
    /// Bootstrap with replacement; otherwise shuffle the original trades.
    pub with_replacement: bool,
    /// Drawdown (percent of peak) that counts as ruin.
    pub ruin_threshold_pct: f64,
    pub target_return_pct: f64,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            simulations: 1000,
            seed: 42,
            confidence_level: 0.95,
            with_replacement: true,
            ruin_threshold_pct: 50.0,
            target_return_pct: 10.0,
        }
    }
}

impl MonteCarloConfig {
    fn validate(&self) -> Result<()> {
        if self.simulations == 0 {
            return Err(EngineError::SimulationConfiguration("simulations must be positive".to_string()));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(EngineError::SimulationConfiguration(format!(
                "confidence level {} must be within (0, 1)",
                self.confidence_level
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DistributionStats {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub p5: f64,
    pub p25: f64,
    pub p75: f64,
    pub p95: f64,
}

impl DistributionStats {
    /// Sample standard deviation; all fields 0 for an empty input.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let std_dev = if n > 1 {
            (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            0.0
        };
        let median = if n % 2 == 0 { (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0 } else { sorted[n / 2] };
        Self {
            mean,
            median,
            std_dev,
            min: sorted[0],
            max: sorted[n - 1],
            p5: percentile(&sorted, 0.05),
            p25: percentile(&sorted, 0.25),
            p75: percentile(&sorted, 0.75),
            p95: percentile(&sorted, 0.95),
        }
    }
}

/// Nearest-rank on an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * p) as usize).min(sorted.len() - 1);
    sorted[idx]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimulationRun {
    pub final_equity: f64,
    pub return_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonteCarloResult {
    pub simulations: usize,
    pub trades_per_simulation: usize,
    pub initial_capital: f64,
    pub original_return_pct: f64,
    pub original_max_drawdown_pct: f64,
    pub returns: DistributionStats,
    pub drawdowns: DistributionStats,
    pub sharpe: DistributionStats,
    pub confidence_level: f64,
    pub return_ci_lower: f64,
    pub return_ci_upper: f64,
    pub probability_of_profit: f64,
    pub probability_of_target: f64,
    pub risk_of_ruin: f64,
    pub runs: Vec<SimulationRun>,
}

impl MonteCarloResult {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

fn replay(pnls: &[f64], initial_capital: f64) -> SimulationRun {
    let mut equity = initial_capital;
    let mut peak = initial_capital;
    let mut max_dd_pct = 0.0_f64;
    let mut returns = Vec::with_capacity(pnls.len());
    for pnl in pnls {
        if equity > 0.0 {
            returns.push(pnl / equity * 100.0);
        }
        equity += pnl;
        peak = peak.max(equity);
        if peak > 0.0 {
            max_dd_pct = max_dd_pct.max((peak - equity) / peak * 100.0);
        }
    }
    SimulationRun {
        final_equity: equity,
        return_pct: (equity - initial_capital) / initial_capital * 100.0,
        max_drawdown_pct: max_dd_pct,
        sharpe_ratio: sharpe(&returns),
    }
}

/// Percent of runs matching `pred`.
fn share(runs: &[SimulationRun], pred: impl Fn(&SimulationRun) -> bool) -> f64 {
    if runs.is_empty() {
        return 0.0;
    }
    runs.iter().filter(|r| pred(r)).count() as f64 / runs.len() as f64 * 100.0
}

/// Resamples `trades` `config.simulations` times. No trades yields an
/// empty result rather than an error.
pub fn monte_carlo(config: &MonteCarloConfig, trades: &[Trade], initial_capital: f64) -> Result<MonteCarloResult> {
    config.validate()?;
    if initial_capital <= 0.0 {
        return Err(EngineError::SimulationConfiguration(format!(
            "initial capital {initial_capital} must be positive"
        )));
    }
    if trades.is_empty() {
        tracing::warn!(domain = Domain::Optimizer.as_str(), "monte carlo skipped: no trades");
        return Ok(MonteCarloResult {
            initial_capital,
            confidence_level: config.confidence_level,
            ..Default::default()
        });
    }

    let pnls: Vec<f64> = trades.iter().map(|t| t.net_pnl).collect();
    let original = replay(&pnls, initial_capital);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut sample = pnls.clone();

    let runs: Vec<SimulationRun> = (0..config.simulations)
        .map(|_| {
            if config.with_replacement {
                for slot in sample.iter_mut() {
                    *slot = pnls[rng.gen_range(0..pnls.len())];
                }
            } else {
                sample.shuffle(&mut rng);
            }
            replay(&sample, initial_capital)
        })
        .collect();

    let n = runs.len();
    let mut finals: Vec<f64> = runs.iter().map(|r| r.return_pct).collect();
    let drawdowns: Vec<f64> = runs.iter().map(|r| r.max_drawdown_pct).collect();
    let sharpes: Vec<f64> = runs.iter().map(|r| r.sharpe_ratio).collect();
    let probability_of_profit = share(&runs, |r| r.return_pct > 0.0);
    let probability_of_target = share(&runs, |r| r.return_pct >= config.target_return_pct);
    let risk_of_ruin = share(&runs, |r| r.max_drawdown_pct > config.ruin_threshold_pct);

    let returns = DistributionStats::from_values(&finals);
    finals.sort_by(f64::total_cmp);
    let alpha = 1.0 - config.confidence_level;
    let lower = ((n as f64 * alpha / 2.0) as usize).min(n - 1);
    let upper = ((n as f64 * (1.0 - alpha / 2.0)) as usize).min(n - 1);

    let result = MonteCarloResult {
        simulations: n,
        trades_per_simulation: pnls.len(),
        initial_capital,
        original_return_pct: original.return_pct,
        original_max_drawdown_pct: original.max_drawdown_pct,
        returns,
        drawdowns: DistributionStats::from_values(&drawdowns),
        sharpe: DistributionStats::from_values(&sharpes),
        confidence_level: config.confidence_level,
        return_ci_lower: finals[lower],
        return_ci_upper: finals[upper],
        probability_of_profit,
        probability_of_target,
        risk_of_ruin,
        runs,
    };

    tracing::info!(
        domain = Domain::Optimizer.as_str(),
        simulations = n,
        trades = pnls.len(),
        mean_return_pct = result.returns.mean,
        ci_lower = result.return_ci_lower,
        ci_upper = result.return_ci_upper,
        risk_of_ruin = result.risk_of_ruin,
        "monte carlo finished"
    );
    Ok(result)
}
