//! Pre-trade risk validation.
//!
//! Checks run in a fixed order and each one appends to either `rejections`
//! (hard fail) or `warnings` (soft fail):
//!
//! 1. trading-hours window
//! 2. order size / order value
//! 3. position size / value (hard), concentration (soft)
//! 4. daily loss, drawdown from peak, total exposure
//! 5. daily order count
//! 6. margin cash (hard), minimum cash balance (soft)
//!
//! Daily counters are reset lazily: every call compares the UTC date of the
//! supplied timestamp with the date of the last reset.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, Timelike};
use serde::Serialize;

use crate::config::env_or;
use crate::error::{EngineError, Result};
use crate::events::{ts_to_datetime, OrderRequest, Side};
use crate::logging::log_risk_check;
use crate::portfolio::PortfolioProvider;

/// Limits applied by the risk pipeline. Zero disables a limit.
#[derive(Debug, Clone, Serialize)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub max_position_value: f64,
    pub max_concentration: f64,
    pub max_total_exposure: f64,
    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    pub max_orders_per_day: u32,
    pub max_order_size: f64,
    pub max_order_value: f64,
    pub min_cash_balance: f64,
    pub margin_requirement: f64,
    pub trading_start_hour: u32,
    pub trading_end_hour: u32,
    pub allow_after_hours: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: 1000.0,
            max_position_value: 50_000.0,
            max_concentration: 0.20,
            max_total_exposure: 500_000.0,
            max_daily_loss: 5_000.0,
            max_drawdown: 0.15,
            max_orders_per_day: 100,
            max_order_size: 500.0,
            max_order_value: 25_000.0,
            min_cash_balance: 10_000.0,
            margin_requirement: 0.5,
            trading_start_hour: 9,
            trading_end_hour: 16,
            allow_after_hours: false,
        }
    }
}

impl RiskLimits {
    /// Defaults with the trading-hours window lifted; historical bars carry
    /// arbitrary timestamps (daily bars at midnight, other exchanges).
    pub fn backtest() -> Self {
        Self { allow_after_hours: true, ..Self::default() }
    }

    /// No limits at all.
    pub fn unlimited() -> Self {
        Self {
            max_position_size: 0.0,
            max_position_value: 0.0,
            max_concentration: 0.0,
            max_total_exposure: 0.0,
            max_daily_loss: 0.0,
            max_drawdown: 0.0,
            max_orders_per_day: 0,
            max_order_size: 0.0,
            max_order_value: 0.0,
            min_cash_balance: 0.0,
            margin_requirement: 0.0,
            trading_start_hour: 0,
            trading_end_hour: 24,
            allow_after_hours: true,
        }
    }

    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_position_size: env_or("RISK_MAX_POSITION_SIZE", d.max_position_size),
            max_position_value: env_or("RISK_MAX_POSITION_VALUE", d.max_position_value),
            max_concentration: env_or("RISK_MAX_CONCENTRATION", d.max_concentration),
            max_total_exposure: env_or("RISK_MAX_TOTAL_EXPOSURE", d.max_total_exposure),
            max_daily_loss: env_or("RISK_MAX_DAILY_LOSS", d.max_daily_loss),
            max_drawdown: env_or("RISK_MAX_DRAWDOWN", d.max_drawdown),
            max_orders_per_day: env_or("RISK_MAX_ORDERS_PER_DAY", d.max_orders_per_day),
            max_order_size: env_or("RISK_MAX_ORDER_SIZE", d.max_order_size),
            max_order_value: env_or("RISK_MAX_ORDER_VALUE", d.max_order_value),
            min_cash_balance: env_or("RISK_MIN_CASH", d.min_cash_balance),
            margin_requirement: env_or("RISK_MARGIN_REQUIREMENT", d.margin_requirement),
            trading_start_hour: env_or("RISK_TRADING_START_HOUR", d.trading_start_hour),
            trading_end_hour: env_or("RISK_TRADING_END_HOUR", d.trading_end_hour),
            allow_after_hours: env_or("RISK_ALLOW_AFTER_HOURS", d.allow_after_hours),
        }
    }
}

/// Outcome of one validation. `approved` is true exactly when there are no
/// rejections; the fields are private so that cannot drift.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskCheckResult {
    approved: bool,
    rejections: Vec<String>,
    warnings: Vec<String>,
    risk_score: f64,
}

impl RiskCheckResult {
    fn new(rejections: Vec<String>, warnings: Vec<String>, risk_score: f64) -> Self {
        Self { approved: rejections.is_empty(), rejections, warnings, risk_score: risk_score.clamp(0.0, 1.0) }
    }

    pub fn approved(&self) -> bool {
        self.approved
    }

    pub fn rejections(&self) -> &[String] {
        &self.rejections
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn risk_score(&self) -> f64 {
        self.risk_score
    }

    /// `Err(RiskRejection)` when rejected, otherwise the warnings (possibly empty).
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.approved {
            Ok(self.warnings)
        } else {
            Err(EngineError::RiskRejection(self.rejections))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub orders_today: u32,
    pub daily_pnl: f64,
    pub peak_portfolio_value: f64,
    pub max_orders_per_day: u32,
    pub max_daily_loss: f64,
}

#[derive(Debug, Default)]
struct DailyCounters {
    orders_today: u32,
    daily_pnl: f64,
    peak_value: f64,
    last_reset: Option<NaiveDate>,
}

pub struct RiskManager {
    limits: RiskLimits,
    portfolio: Arc<dyn PortfolioProvider>,
    counters: Mutex<DailyCounters>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, portfolio: Arc<dyn PortfolioProvider>) -> Self {
        Self { limits, portfolio, counters: Mutex::new(DailyCounters::default()) }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    // Lock and roll the daily counters over if `now_ts` is on a new UTC date.
    fn counters(&self, now_ts: i64) -> MutexGuard<'_, DailyCounters> {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let today = ts_to_datetime(now_ts).date_naive();
        if c.last_reset != Some(today) {
            if c.last_reset.is_some() {
                tracing::info!(domain = "risk", date = %today, "daily risk counters reset");
            }
            c.orders_today = 0;
            c.daily_pnl = 0.0;
            c.last_reset = Some(today);
        }
        c
    }

    /// Validate the request shape, then run the pipeline.
    pub fn check_order(&self, order: &OrderRequest, now_ts: i64) -> Result<RiskCheckResult> {
        if order.symbol.is_empty() {
            return Err(EngineError::validation("order has empty symbol"));
        }
        if !(order.quantity > 0.0) {
            return Err(EngineError::validation(format!("order quantity must be positive, got {}", order.quantity)));
        }
        if !(order.price > 0.0) {
            return Err(EngineError::validation(format!("order price must be positive, got {}", order.price)));
        }
        Ok(self.validate_order(order, now_ts))
    }

    pub fn validate_order(&self, order: &OrderRequest, now_ts: i64) -> RiskCheckResult {
        let mut rejections = Vec::new();
        let mut warnings = Vec::new();

        // Portfolio reads happen before the counters lock is taken.
        let summary = match self.portfolio.summary() {
            Ok(s) => Some(s),
            Err(e) => {
                warnings.push(format!("Portfolio unavailable, portfolio checks skipped: {}", e));
                None
            }
        };
        let current = self.portfolio.position(&order.symbol).map(|p| p.quantity).unwrap_or(0.0);
        let mut counters = self.counters(now_ts);

        self.check_trading_hours(now_ts, &mut rejections);
        self.check_order_size(order, &mut rejections);
        self.check_position_limits(order, current, summary.as_ref().map(|s| s.total_value), &mut rejections, &mut warnings);
        if let Some(s) = &summary {
            self.check_portfolio_limits(order, s.total_value, s.exposure, &mut counters, &mut rejections);
        }
        if self.limits.max_orders_per_day > 0 && counters.orders_today >= self.limits.max_orders_per_day {
            rejections.push(format!("Daily order limit reached: {} orders", counters.orders_today));
        }
        if let Some(s) = &summary {
            self.check_margin(order, s.cash, &mut rejections, &mut warnings);
        }
        drop(counters);

        let mut score = rejections.len() as f64 * 0.5 + warnings.len() as f64 * 0.1;
        if self.limits.max_order_size > 0.0 {
            score += order.quantity / self.limits.max_order_size * 0.3;
        }
        let result = RiskCheckResult::new(rejections, warnings, score);
        log_risk_check(
            &order.symbol,
            result.approved,
            result.rejections.len(),
            result.warnings.len(),
            result.risk_score,
        );
        result
    }

    fn check_trading_hours(&self, now_ts: i64, rejections: &mut Vec<String>) {
        if self.limits.allow_after_hours {
            return;
        }
        let hour = ts_to_datetime(now_ts).hour();
        if hour < self.limits.trading_start_hour || hour >= self.limits.trading_end_hour {
            rejections.push(format!(
                "Trading not allowed outside hours {}:00-{}:00",
                self.limits.trading_start_hour, self.limits.trading_end_hour
            ));
        }
    }

    fn check_order_size(&self, order: &OrderRequest, rejections: &mut Vec<String>) {
        if self.limits.max_order_size > 0.0 && order.quantity > self.limits.max_order_size {
            rejections.push(format!(
                "Order size {} exceeds maximum {}",
                order.quantity, self.limits.max_order_size
            ));
        }
        let value = order.notional();
        if self.limits.max_order_value > 0.0 && value > self.limits.max_order_value {
            rejections.push(format!(
                "Order value ${:.2} exceeds maximum ${:.2}",
                value, self.limits.max_order_value
            ));
        }
    }

    fn check_position_limits(
        &self,
        order: &OrderRequest,
        current: f64,
        total_value: Option<f64>,
        rejections: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) {
        let new_qty = match order.side {
            Side::Buy => current + order.quantity,
            Side::Sell => current - order.quantity,
        };
        if self.limits.max_position_size > 0.0 && new_qty.abs() > self.limits.max_position_size {
            rejections.push(format!(
                "New position size {} exceeds maximum {}",
                new_qty.abs(),
                self.limits.max_position_size
            ));
        }
        let new_value = (new_qty * order.price).abs();
        if self.limits.max_position_value > 0.0 && new_value > self.limits.max_position_value {
            rejections.push(format!(
                "New position value ${:.2} exceeds maximum ${:.2}",
                new_value, self.limits.max_position_value
            ));
        }
        if self.limits.max_concentration > 0.0 && order.side == Side::Buy {
            if let Some(total) = total_value.filter(|t| *t > 0.0) {
                let concentration = new_value / total;
                if concentration > self.limits.max_concentration {
                    warnings.push(format!(
                        "Position concentration {:.1}% exceeds recommended {:.1}%",
                        concentration * 100.0,
                        self.limits.max_concentration * 100.0
                    ));
                }
            }
        }
    }

    fn check_portfolio_limits(
        &self,
        order: &OrderRequest,
        total_value: f64,
        exposure: f64,
        counters: &mut DailyCounters,
        rejections: &mut Vec<String>,
    ) {
        if self.limits.max_daily_loss > 0.0 && counters.daily_pnl < -self.limits.max_daily_loss {
            rejections.push(format!("Daily loss limit exceeded: ${:.2}", counters.daily_pnl));
        }
        if total_value > counters.peak_value {
            counters.peak_value = total_value;
        }
        if self.limits.max_drawdown > 0.0 && counters.peak_value > 0.0 {
            let drawdown = (counters.peak_value - total_value) / counters.peak_value;
            if drawdown > self.limits.max_drawdown {
                rejections.push(format!(
                    "Drawdown {:.1}% exceeds maximum {:.1}%",
                    drawdown * 100.0,
                    self.limits.max_drawdown * 100.0
                ));
            }
        }
        if self.limits.max_total_exposure > 0.0 {
            let new_exposure = match order.side {
                Side::Buy => exposure + order.notional(),
                Side::Sell => exposure,
            };
            if new_exposure > self.limits.max_total_exposure {
                rejections.push(format!(
                    "Total exposure ${:.2} exceeds maximum ${:.2}",
                    new_exposure, self.limits.max_total_exposure
                ));
            }
        }
    }

    fn check_margin(&self, order: &OrderRequest, cash: f64, rejections: &mut Vec<String>, warnings: &mut Vec<String>) {
        if order.side != Side::Buy {
            return;
        }
        let mut required = order.notional();
        if self.limits.margin_requirement > 0.0 {
            required *= self.limits.margin_requirement;
        }
        if cash < required {
            rejections.push(format!(
                "Insufficient cash: ${:.2} required, ${:.2} available",
                required, cash
            ));
        }
        if cash - required < self.limits.min_cash_balance {
            warnings.push(format!(
                "Order would leave cash balance below minimum: ${:.2}",
                self.limits.min_cash_balance
            ));
        }
    }

    /// Count a submitted order against today's limit.
    pub fn record_order(&self, now_ts: i64) {
        let mut c = self.counters(now_ts);
        c.orders_today += 1;
    }

    pub fn update_daily_pnl(&self, pnl: f64, now_ts: i64) {
        let mut c = self.counters(now_ts);
        c.daily_pnl += pnl;
    }

    pub fn metrics(&self) -> RiskMetrics {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        RiskMetrics {
            orders_today: c.orders_today,
            daily_pnl: c.daily_pnl,
            peak_portfolio_value: c.peak_value,
            max_orders_per_day: self.limits.max_orders_per_day,
            max_daily_loss: self.limits.max_daily_loss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{OrderFilled, OrderType};
    use crate::portfolio::InMemoryPortfolio;

    // 2024-03-05 14:00:00 UTC, inside the default 9-16 window
    const MIDDAY: i64 = 1_709_647_200;

    fn order(side: Side, qty: f64, price: f64) -> OrderRequest {
        OrderRequest {
            id: "o1".into(),
            strategy_id: "s1".into(),
            symbol: "SPY".into(),
            side,
            quantity: qty,
            price,
            order_type: OrderType::Market,
        }
    }

    fn make_manager(limits: RiskLimits, cash: f64) -> (RiskManager, Arc<InMemoryPortfolio>) {
        let portfolio = Arc::new(InMemoryPortfolio::new(cash));
        (RiskManager::new(limits, portfolio.clone()), portfolio)
    }

    #[test]
    fn test_order_size_limit_rejects() {
        let (rm, _) = make_manager(RiskLimits::default(), 1_000_000.0);
        let res = rm.validate_order(&order(Side::Buy, 501.0, 10.0), MIDDAY);
        assert!(!res.approved());
        assert!(res.rejections().iter().any(|r| r == "Order size 501 exceeds maximum 500"), "{:?}", res);
    }

    #[test]
    fn test_clean_order_approved() {
        let (rm, _) = make_manager(RiskLimits::default(), 100_000.0);
        let res = rm.validate_order(&order(Side::Buy, 100.0, 100.0), MIDDAY);
        assert!(res.approved(), "{:?}", res);
        assert!(res.rejections().is_empty());
        // 100/500 * 0.3
        assert!((res.risk_score() - 0.06).abs() < 1e-9);
    }

    #[test]
    fn test_order_value_limit_rejects() {
        let (rm, _) = make_manager(RiskLimits::default(), 1_000_000.0);
        let res = rm.validate_order(&order(Side::Buy, 300.0, 100.0), MIDDAY);
        assert!(!res.approved());
        assert!(res.rejections().iter().any(|r| r.starts_with("Order value $30000.00")));
    }

    #[test]
    fn test_outside_trading_hours() {
        let (rm, _) = make_manager(RiskLimits::default(), 100_000.0);
        let night = MIDDAY + 8 * 3600; // 22:00 UTC
        let res = rm.validate_order(&order(Side::Buy, 10.0, 10.0), night);
        assert_eq!(res.rejections()[0], "Trading not allowed outside hours 9:00-16:00");

        let (rm, _) = make_manager(RiskLimits::backtest(), 100_000.0);
        assert!(rm.validate_order(&order(Side::Buy, 10.0, 10.0), night).approved());
    }

    #[test]
    fn test_checks_run_in_order() {
        let limits = RiskLimits { max_orders_per_day: 1, ..RiskLimits::default() };
        let (rm, _) = make_manager(limits, 1_000.0);
        rm.record_order(MIDDAY);
        let night = MIDDAY + 8 * 3600;
        let res = rm.validate_order(&order(Side::Buy, 600.0, 100.0), night);
        let firsts: Vec<&str> = res.rejections().iter().map(|r| r.split_whitespace().next().unwrap_or("")).collect();
        assert_eq!(
            firsts,
            vec!["Trading", "Order", "Order", "New", "Total", "Daily", "Insufficient"],
            "{:?}",
            res.rejections()
        );
        assert_eq!(res.risk_score(), 1.0);
    }

    #[test]
    fn test_concentration_is_warning_only() {
        let (rm, portfolio) = make_manager(RiskLimits::default(), 100_000.0);
        portfolio.apply_fill(&OrderFilled {
            order_id: "f".into(),
            strategy_id: "s1".into(),
            symbol: "SPY".into(),
            side: Side::Buy,
            quantity: 150.0,
            price: 100.0,
            commission: 0.0,
            ts: MIDDAY,
        });
        let res = rm.validate_order(&order(Side::Buy, 100.0, 100.0), MIDDAY);
        assert!(res.approved(), "{:?}", res);
        assert!(res.warnings().iter().any(|w| w.starts_with("Position concentration 25.0%")));
    }

    #[test]
    fn test_min_cash_warning_and_insufficient_cash() {
        let (rm, _) = make_manager(RiskLimits::default(), 12_000.0);
        let res = rm.validate_order(&order(Side::Buy, 100.0, 100.0), MIDDAY);
        assert!(res.approved());
        assert!(res.warnings().iter().any(|w| w.contains("below minimum")));

        let (rm, _) = make_manager(RiskLimits::default(), 1_000.0);
        let res = rm.validate_order(&order(Side::Buy, 100.0, 100.0), MIDDAY);
        assert!(!res.approved());
        assert!(res.rejections().iter().any(|r| r.starts_with("Insufficient cash: $5000.00 required")));
    }

    #[test]
    fn test_daily_counters_reset_on_new_date() {
        let limits = RiskLimits { max_orders_per_day: 2, ..RiskLimits::default() };
        let (rm, _) = make_manager(limits, 100_000.0);
        rm.record_order(MIDDAY);
        rm.record_order(MIDDAY);
        rm.update_daily_pnl(-6_000.0, MIDDAY);
        let res = rm.validate_order(&order(Side::Buy, 10.0, 10.0), MIDDAY);
        assert!(res.rejections().iter().any(|r| r.starts_with("Daily order limit")));
        assert!(res.rejections().iter().any(|r| r.starts_with("Daily loss limit exceeded")));

        let tomorrow = MIDDAY + 86_400;
        let res = rm.validate_order(&order(Side::Buy, 10.0, 10.0), tomorrow);
        assert!(res.approved(), "{:?}", res);
        assert_eq!(rm.metrics().orders_today, 0);
    }

    #[test]
    fn test_drawdown_from_peak() {
        let (rm, portfolio) = make_manager(RiskLimits::default(), 100_000.0);
        assert!(rm.validate_order(&order(Side::Buy, 10.0, 10.0), MIDDAY).approved());
        portfolio.set_cash(80_000.0);
        let res = rm.validate_order(&order(Side::Buy, 10.0, 10.0), MIDDAY);
        assert!(res.rejections().iter().any(|r| r == "Drawdown 20.0% exceeds maximum 15.0%"), "{:?}", res);
        assert_eq!(rm.metrics().peak_portfolio_value, 100_000.0);
    }

    /// Reads the risk metrics back from inside every portfolio call.
    struct ReentrantBook {
        inner: InMemoryPortfolio,
        risk: std::sync::OnceLock<std::sync::Weak<RiskManager>>,
        reads: std::sync::atomic::AtomicU32,
    }

    impl ReentrantBook {
        fn peek(&self) {
            if let Some(rm) = self.risk.get().and_then(|w| w.upgrade()) {
                let _ = rm.metrics();
                self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    impl PortfolioProvider for ReentrantBook {
        fn position(&self, symbol: &str) -> Option<crate::portfolio::Position> {
            self.peek();
            self.inner.position(symbol)
        }

        fn summary(&self) -> Result<crate::portfolio::PortfolioSummary> {
            self.peek();
            self.inner.summary()
        }
    }

    #[test]
    fn test_portfolio_read_outside_counters_lock() {
        let book = Arc::new(ReentrantBook {
            inner: InMemoryPortfolio::new(100_000.0),
            risk: std::sync::OnceLock::new(),
            reads: std::sync::atomic::AtomicU32::new(0),
        });
        let rm = Arc::new(RiskManager::new(RiskLimits::default(), book.clone()));
        let _ = book.risk.set(Arc::downgrade(&rm));

        let res = rm.validate_order(&order(Side::Buy, 10.0, 10.0), MIDDAY);
        assert!(res.approved(), "{:?}", res);
        assert_eq!(book.reads.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_check_order_validates_shape() {
        let (rm, _) = make_manager(RiskLimits::default(), 100_000.0);
        let err = rm.check_order(&order(Side::Buy, 0.0, 10.0), MIDDAY).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        let res = rm.check_order(&order(Side::Buy, 501.0, 10.0), MIDDAY).unwrap();
        let err = res.into_result().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RiskRejection);
    }
}
