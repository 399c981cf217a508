//! Live signal routing.
//!
//! Turns bus signals into orders: risk pipeline, audit trail, then the
//! order gateway behind a circuit breaker. Fills are booked into the
//! portfolio the risk checks read, then go back onto the bus as
//! `OrderFilled` so strategy runners see them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::AuditLogger;
use crate::bus::{EventBus, Subscription};
use crate::error::{EngineError, Result};
use crate::events::{Event, EventType, OrderFilled, OrderRequest, Side, Signal};
use crate::logging::{self, Domain};
use crate::portfolio::{InMemoryPortfolio, PortfolioProvider};
use crate::reliability::circuit::{CircuitBreaker, CircuitConfig};
use crate::risk::RiskManager;

/// Order execution collaborator.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderFilled>;
}

/// Fills every order immediately at its requested price.
#[derive(Debug, Clone, Default)]
pub struct PaperGateway {
    pub commission: f64,
}

impl PaperGateway {
    pub fn new(commission: f64) -> Self {
        Self { commission }
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderFilled> {
        Ok(OrderFilled {
            order_id: order.id.clone(),
            strategy_id: order.strategy_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: order.price,
            commission: self.commission,
            ts: Utc::now().timestamp(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub signals: u64,
    pub rejected: u64,
    pub submitted: u64,
    pub filled: u64,
    pub failed: u64,
}

pub struct SignalRouter {
    bus: EventBus,
    risk: Arc<RiskManager>,
    portfolio: Arc<InMemoryPortfolio>,
    audit: Arc<AuditLogger>,
    gateway: Arc<dyn OrderGateway>,
    breaker: Arc<CircuitBreaker>,
    next_id: AtomicU64,
    stats: Mutex<RouterStats>,
}

impl SignalRouter {
    /// `portfolio` must be the book `risk` reads; fills are applied to it.
    pub fn new(
        bus: EventBus,
        risk: Arc<RiskManager>,
        portfolio: Arc<InMemoryPortfolio>,
        audit: Arc<AuditLogger>,
        gateway: Arc<dyn OrderGateway>,
    ) -> Self {
        Self {
            bus,
            risk,
            portfolio,
            audit,
            gateway,
            breaker: Arc::new(CircuitBreaker::new("order_gateway", CircuitConfig::external_api())),
            next_id: AtomicU64::new(1),
            stats: Mutex::new(RouterStats::default()),
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn stats(&self) -> RouterStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self, f: impl FnOnce(&mut RouterStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn order_id(&self) -> String {
        format!("ord-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    // Audit writes run on the blocking pool; failures never block order flow.
    async fn record_audit<T, F>(&self, what: &'static str, write: F)
    where
        F: FnOnce(&AuditLogger) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let audit = self.audit.clone();
        let r = tokio::task::spawn_blocking(move || write(&audit))
            .await
            .map_err(|e| EngineError::TransientInfrastructure(format!("audit task failed: {}", e)))
            .and_then(|r| r);
        if let Err(e) = r {
            tracing::warn!(domain = Domain::Audit.as_str(), record = what, error = %e, "audit write failed");
        }
    }

    async fn reject(&self, order: &OrderRequest, reasons: Vec<String>, violation: bool) {
        self.bump(|s| s.rejected += 1);
        let (o, r) = (order.clone(), reasons.clone());
        self.record_audit("order_rejected", move |a| a.log_order_rejected(&o, &r)).await;
        if violation {
            let o = order.clone();
            self.record_audit("risk_violation", move |a| a.log_risk_violation(&o, &reasons)).await;
        }
    }

    // Long-only: a sell may close at most what is held.
    fn check_sell_cover(&self, order: &OrderRequest) -> Option<String> {
        if order.side != Side::Sell {
            return None;
        }
        let held = self.portfolio.position(&order.symbol).map(|p| p.quantity).unwrap_or(0.0);
        if order.quantity > held {
            Some(format!("Sell quantity {} exceeds open position {}", order.quantity, held))
        } else {
            None
        }
    }

    /// Route one signal end to end.
    ///
    /// Risk rejections come back as `RiskRejection` with nothing submitted;
    /// gateway failures come back as `TransientInfrastructure` (or
    /// `CircuitOpen` while the breaker is tripped) and are not retried.
    pub async fn route(&self, signal: &Signal) -> Result<OrderFilled> {
        self.bump(|s| s.signals += 1);
        let order = OrderRequest::from_signal(self.order_id(), signal);

        let check = match self.risk.check_order(&order, signal.ts) {
            Ok(c) => c,
            Err(e) => {
                self.reject(&order, vec![e.to_string()], false).await;
                return Err(e);
            }
        };
        let mut rejections = check.rejections().to_vec();
        rejections.extend(self.check_sell_cover(&order));
        if !rejections.is_empty() {
            self.reject(&order, rejections.clone(), true).await;
            return Err(EngineError::RiskRejection(rejections));
        }

        let created = order.clone();
        self.record_audit("order_created", move |a| a.log_order_created(None, &created)).await;
        self.bump(|s| s.submitted += 1);
        let gateway = self.gateway.clone();
        let request = order.clone();
        let submitted = self
            .breaker
            .call_async(|| async move { gateway.submit(&request).await })
            .await
            .map_err(|e| match e {
                EngineError::CircuitOpen { .. } | EngineError::TransientInfrastructure(_) => e,
                other => EngineError::TransientInfrastructure(format!("order submission failed: {}", other)),
            });

        let fill = match submitted {
            Ok(f) => f,
            Err(e) => {
                self.bump(|s| s.failed += 1);
                tracing::warn!(
                    domain = Domain::Exec.as_str(),
                    strategy_id = %signal.strategy_id,
                    symbol = %signal.symbol,
                    kind = e.kind().as_str(),
                    error = %e,
                    "order submission failed"
                );
                let (id, reason) = (order.id.clone(), e.to_string());
                self.record_audit("order_cancelled", move |a| a.log_order_cancelled(&id, &reason)).await;
                return Err(e);
            }
        };

        self.risk.record_order(signal.ts);
        let realized = self.portfolio.apply_fill(&fill) - fill.commission;
        self.risk.update_daily_pnl(realized, signal.ts);
        let filled = fill.clone();
        self.record_audit("order_filled", move |a| a.log_order_filled(&filled)).await;
        if fill.side == Side::Sell {
            let f = fill.clone();
            self.record_audit("trade_executed", move |a| {
                a.log_trade_executed(&f.strategy_id, &f.symbol, f.side, f.quantity, f.price, realized)
            })
            .await;
        }
        logging::log_fill(&fill.strategy_id, &fill.symbol, fill.side.as_str(), fill.quantity, fill.price, fill.ts);
        // Counted once fully recorded, so `stats().filled` implies the audit rows exist.
        self.bump(|s| s.filled += 1);
        self.bus.publish(Event::OrderFilled(fill.clone()));
        Ok(fill)
    }

    /// Consume signals from the bus until `stop` is called.
    pub fn start(self: Arc<Self>) -> Result<RouterHandle> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::validation(format!("no tokio runtime: {}", e)))?;
        let signals = self.bus.subscribe(EventType::Signal);
        let sub_id = signals.id;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = handle.spawn(route_loop(self.clone(), signals, stop_rx));
        self.bus.publish(Event::status("signal_router", "RUNNING", "router started"));
        tracing::info!(domain = Domain::System.as_str(), "signal router running");
        Ok(RouterHandle { router: self, sub_id, stop_tx, task })
    }
}

pub struct RouterHandle {
    router: Arc<SignalRouter>,
    sub_id: u64,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RouterHandle {
    pub fn router(&self) -> &Arc<SignalRouter> {
        &self.router
    }

    pub async fn stop(self) -> Result<RouterStats> {
        let _ = self.stop_tx.send(true);
        self.task
            .await
            .map_err(|e| EngineError::TransientInfrastructure(format!("router task failed: {}", e)))?;
        self.router.bus.unsubscribe(self.sub_id);
        self.router.bus.publish(Event::status("signal_router", "STOPPED", "router stopped"));
        tracing::info!(domain = Domain::System.as_str(), "signal router stopped");
        Ok(self.router.stats())
    }
}

async fn route_loop(router: Arc<SignalRouter>, mut signals: Subscription, mut stop_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            event = signals.recv() => match event {
                Some(Event::Signal(signal)) => {
                    if let Err(e) = router.route(&signal).await {
                        tracing::debug!(
                            domain = Domain::Exec.as_str(),
                            strategy_id = %signal.strategy_id,
                            kind = e.kind().as_str(),
                            error = %e,
                            "signal not executed"
                        );
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, AuditEventType, AuditQuery};
    use crate::events::Bar;
    use crate::portfolio::InMemoryPortfolio;
    use crate::risk::RiskLimits;
    use std::sync::atomic::AtomicBool;

    struct FlakyGateway {
        fail: AtomicBool,
    }

    #[async_trait]
    impl OrderGateway for FlakyGateway {
        async fn submit(&self, order: &OrderRequest) -> Result<OrderFilled> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::validation("broker said no"));
            }
            PaperGateway::default().submit(order).await
        }
    }

    fn router(gateway: Arc<dyn OrderGateway>, limits: RiskLimits) -> (SignalRouter, Arc<AuditLogger>, EventBus) {
        let bus = EventBus::new(64);
        let portfolio = Arc::new(InMemoryPortfolio::new(100_000.0));
        let risk = Arc::new(RiskManager::new(limits, portfolio.clone()));
        let audit = Arc::new(AuditLogger::open_in_memory(AuditConfig::default()).unwrap());
        (SignalRouter::new(bus.clone(), risk, portfolio, audit.clone(), gateway), audit, bus)
    }

    fn signal_at(side: Side, qty: f64, price: f64) -> Signal {
        let bar = Bar::new("SPY", 1_709_649_000, price, price + 1.0, price - 1.0, price, 1000.0);
        Signal::new("rsi", &bar, side, 0.8, qty, "test".to_string())
    }

    fn signal(qty: f64) -> Signal {
        signal_at(Side::Buy, qty, 100.0)
    }

    #[tokio::test]
    async fn test_route_fills_and_publishes() {
        let (router, audit, bus) = router(Arc::new(PaperGateway::new(1.0)), RiskLimits::unlimited());
        let mut fills = bus.subscribe(EventType::OrderFilled);
        let fill = router.route(&signal(10.0)).await.unwrap();
        assert_eq!(fill.quantity, 10.0);
        assert!(matches!(fills.try_recv(), Some(Event::OrderFilled(_))));
        assert_eq!(router.stats().filled, 1);
        let types: Vec<String> = audit
            .query(&AuditQuery::default())
            .unwrap()
            .iter()
            .map(|e| e.event_type.as_str().to_string())
            .collect();
        assert!(types.contains(&"order_created".to_string()));
        assert!(types.contains(&"order_filled".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_order_is_not_submitted() {
        let limits = RiskLimits { max_position_size: 5.0, ..RiskLimits::unlimited() };
        let (router, audit, _bus) = router(Arc::new(PaperGateway::default()), limits);
        let err = router.route(&signal(10.0)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RiskRejection);
        let stats = router.stats();
        assert_eq!((stats.rejected, stats.submitted), (1, 0));
        assert_eq!(audit.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_gateway_failures_trip_breaker() {
        let gw = Arc::new(FlakyGateway { fail: AtomicBool::new(true) });
        let (router, _audit, _bus) = router(gw, RiskLimits::unlimited());
        let cfg = CircuitConfig { max_failures: 2, ..CircuitConfig::external_api() };
        let router = router.with_breaker(Arc::new(CircuitBreaker::new("gw", cfg)));

        for _ in 0..2 {
            let err = router.route(&signal(1.0)).await.unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::TransientInfrastructure);
        }
        let err = router.route(&signal(1.0)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CircuitOpen);
        assert_eq!(router.stats().failed, 3);
        assert!(router.portfolio.position("SPY").is_none());
    }

    #[tokio::test]
    async fn test_failed_submission_is_audited_as_cancelled() {
        let gw = Arc::new(FlakyGateway { fail: AtomicBool::new(true) });
        let (router, audit, _bus) = router(gw, RiskLimits::unlimited());
        router.route(&signal(1.0)).await.unwrap_err();
        let q = AuditQuery { resource: Some("order:ord-1".into()), ..Default::default() };
        let types: Vec<AuditEventType> = audit.query(&q).unwrap().iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![AuditEventType::OrderCancelled, AuditEventType::OrderCreated]);
    }

    #[tokio::test]
    async fn test_fills_update_portfolio_and_daily_pnl() {
        let (router, audit, _bus) = router(Arc::new(PaperGateway::new(1.0)), RiskLimits::unlimited());
        router.route(&signal_at(Side::Buy, 10.0, 100.0)).await.unwrap();
        let pos = router.portfolio.position("SPY").unwrap();
        assert_eq!((pos.quantity, pos.avg_price), (10.0, 100.0));

        router.route(&signal_at(Side::Sell, 10.0, 110.0)).await.unwrap();
        assert!(router.portfolio.position("SPY").is_none());
        // +100 realized, two $1 commissions
        assert!((router.risk.metrics().daily_pnl - 98.0).abs() < 1e-9);
        let trades = audit
            .query(&AuditQuery { event_type: Some(AuditEventType::TradeExecuted), ..Default::default() })
            .unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn test_sell_without_position_is_rejected() {
        let (router, audit, _bus) = router(Arc::new(PaperGateway::default()), RiskLimits::unlimited());
        let err = router.route(&signal_at(Side::Sell, 5.0, 100.0)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RiskRejection);
        assert!(err.to_string().contains("exceeds open position 0"), "{}", err);
        assert_eq!(router.stats().submitted, 0);
        assert_eq!(audit.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_router_loop_consumes_bus_signals() {
        let (router, _audit, bus) = router(Arc::new(PaperGateway::default()), RiskLimits::unlimited());
        let mut fills = bus.subscribe(EventType::OrderFilled);
        let handle = Arc::new(router).start().unwrap();
        bus.publish(Event::Signal(signal(3.0)));
        let fill = tokio::time::timeout(std::time::Duration::from_secs(2), fills.recv()).await.unwrap();
        assert!(matches!(fill, Some(Event::OrderFilled(f)) if f.quantity == 3.0));
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.filled, 1);
        assert_eq!(bus.subscriber_count(EventType::Signal), 0);
    }
}
