use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tradecore::audit::{AuditConfig, AuditLogger};
use tradecore::backtest::{BacktestConfig, BacktestEngine};
use tradecore::bus::EventBus;
use tradecore::cancel::CancelFlag;
use tradecore::config::Config;
use tradecore::data;
use tradecore::events::{Bar, Event};
use tradecore::logging::{self, Domain};
use tradecore::optimizer::{self, GridSearchConfig, Metric, MonteCarloConfig, WalkForwardConfig};
use tradecore::params::{ParamRange, ParameterSet};
use tradecore::portfolio::InMemoryPortfolio;
use tradecore::reliability::{CircuitConfig, CircuitManager};
use tradecore::report;
use tradecore::risk::{RiskLimits, RiskManager};
use tradecore::router::{PaperGateway, SignalRouter};
use tradecore::strategy::{self, StrategyRunner};

const SYNTHETIC_START: i64 = 1_704_067_200; // 2024-01-01 UTC
const SYNTHETIC_INTERVAL: i64 = 900;
const SYNTHETIC_DAYS: usize = 120;

fn load_bars(cfg: &Config) -> Result<Vec<Bar>> {
    match &cfg.data_csv {
        Some(path) => {
            let loaded = data::load_csv(Path::new(path), &cfg.symbol, SYNTHETIC_INTERVAL)
                .with_context(|| format!("loading {}", path))?;
            tracing::info!(
                domain = Domain::Market.as_str(),
                path = %path,
                rows = loaded.manifest.row_count,
                bad_rows = loaded.manifest.bad_rows,
                gaps = loaded.manifest.gaps.len(),
                hash = %loaded.manifest.hash_sha256,
                "bars loaded"
            );
            Ok(loaded.bars)
        }
        None => {
            let count = SYNTHETIC_DAYS * 86_400 / SYNTHETIC_INTERVAL as usize;
            tracing::info!(domain = Domain::Market.as_str(), bars = count, "no DATA_CSV, using synthetic bars");
            Ok(data::synthetic_bars(&cfg.symbol, SYNTHETIC_START, SYNTHETIC_INTERVAL, count, 100.0, 7))
        }
    }
}

async fn replay_live(cfg: &Config, bars: &[Bar], audit: Arc<AuditLogger>) -> Result<()> {
    let bus = EventBus::new(cfg.bus_buffer_size);
    let portfolio = Arc::new(InMemoryPortfolio::new(cfg.initial_capital));
    let risk = Arc::new(RiskManager::new(RiskLimits::backtest(), portfolio.clone()));
    let router = Arc::new(SignalRouter::new(bus.clone(), risk, portfolio, audit.clone(), Arc::new(PaperGateway::new(1.0))));
    let router = router.start()?;

    let symbols = vec![cfg.symbol.clone()];
    let mut runner =
        StrategyRunner::new(strategy::build("rsi", &ParameterSet::new(), &symbols)?, bus.clone()).with_audit(audit);
    runner.initialize()?;
    runner.start()?;

    for bar in bars {
        bus.publish_blocking(Event::MarketData(bar.clone())).await;
    }
    // Let the runner and router drain what is still queued.
    tokio::time::sleep(Duration::from_millis(200)).await;

    runner.stop().await?;
    let stats = router.stop().await?;
    println!(
        "\nLive replay: {} signals, {} filled, {} rejected, {} failed",
        stats.signals, stats.filled, stats.rejected, stats.failed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cfg = Config::from_env();
    let bars = load_bars(&cfg)?;

    let circuits = CircuitManager::new();
    let audit_cfg = AuditConfig { retention_months: cfg.audit_retention_months, max_page_size: cfg.audit_max_page };
    let audit = Arc::new(
        AuditLogger::open(&cfg.audit_db_path, audit_cfg)?.with_breaker(circuits.get_or_create("audit_db", CircuitConfig::database())),
    );
    let purged = audit.purge_expired(chrono::Utc::now())?;
    tracing::info!(domain = Domain::Audit.as_str(), purged, partitions = audit.partitions()?.len(), "audit store open");

    let bt_cfg = BacktestConfig { symbol: cfg.symbol.clone(), initial_capital: cfg.initial_capital, ..Default::default() };
    let cancel = CancelFlag::new();
    let symbols = vec![cfg.symbol.clone()];

    // Single backtest
    let engine = BacktestEngine::new(bt_cfg.clone())?;
    let mut rsi = strategy::build("rsi", &ParameterSet::new(), &symbols)?;
    let result = engine.run(rsi.as_mut(), &bars, &cancel)?;
    println!("{}", report::summary(&result));
    println!("{}", report::trade_log(&result.trades[..result.trades.len().min(10)]));
    println!("fingerprint {}", result.fingerprint());
    if let Some(dir) = &cfg.report_dir {
        report::export(&result, Path::new(dir), "rsi")?;
    }

    // Grid search
    let mut grid = GridSearchConfig::new(
        bt_cfg.clone(),
        vec![ParamRange::int_range("short_period", 5, 20, 5), ParamRange::int_range("long_period", 30, 60, 10)],
        Metric::SharpeRatio,
    );
    grid.workers = cfg.optimizer_workers;
    grid.max_combinations = cfg.optimizer_max_combinations;
    let sweep = optimizer::grid_search(&grid, &bars, optimizer::named_factory("ma_crossover", symbols.clone()), &cancel)?;
    println!("{}", report::leaderboard(&sweep.results, 5, grid.metric));
    if !sweep.is_complete() {
        println!("(partial sweep: {} of {} combinations)", sweep.attempted, sweep.total);
    }

    // Walk-forward
    let wf_grid = GridSearchConfig {
        ranges: vec![ParamRange::int_range("period", 10, 20, 5), ParamRange::float_range("oversold", 25.0, 30.0, 5.0)],
        ..grid.clone()
    };
    let wf = optimizer::walk_forward(&WalkForwardConfig::new(wf_grid, 30, 10), &bars, optimizer::named_factory("rsi", symbols.clone()), &cancel)?;
    println!("{}", report::walk_forward_report(&wf));

    // Monte Carlo over the single backtest's trades
    let mc = optimizer::monte_carlo(&MonteCarloConfig::default(), &result.trades, result.initial_capital)?;
    println!("{}", report::monte_carlo_report(&mc));

    // Live path over the last week of bars
    let tail = bars.len().saturating_sub(7 * 96);
    replay_live(&cfg, &bars[tail..], audit.clone()).await?;
    println!("Audit records: {}", audit.count()?);

    for m in circuits.all_metrics() {
        tracing::info!(domain = Domain::System.as_str(), breaker = %m.name, state = m.state.as_str(), "breaker state");
    }
    Ok(())
}
