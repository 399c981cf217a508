//! Append-only audit trail backed by SQLite.
//!
//! Rows carry a `partition_month` key (`YYYY-MM`); retention is enforced by
//! dropping whole months older than the configured window. There is no API
//! to update or delete individual events.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::events::{OrderFilled, OrderRequest, Side};
use crate::reliability::CircuitBreaker;

pub const DEFAULT_QUERY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    OrderCreated,
    OrderFilled,
    OrderCancelled,
    OrderRejected,
    TradeExecuted,
    PositionOpened,
    PositionClosed,
    UserLogin,
    UserLogout,
    StrategyStart,
    StrategyStop,
    RiskViolation,
    SystemStart,
    SystemStop,
    ConfigChange,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 15] = [
        AuditEventType::OrderCreated,
        AuditEventType::OrderFilled,
        AuditEventType::OrderCancelled,
        AuditEventType::OrderRejected,
        AuditEventType::TradeExecuted,
        AuditEventType::PositionOpened,
        AuditEventType::PositionClosed,
        AuditEventType::UserLogin,
        AuditEventType::UserLogout,
        AuditEventType::StrategyStart,
        AuditEventType::StrategyStop,
        AuditEventType::RiskViolation,
        AuditEventType::SystemStart,
        AuditEventType::SystemStop,
        AuditEventType::ConfigChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::OrderCreated => "order_created",
            AuditEventType::OrderFilled => "order_filled",
            AuditEventType::OrderCancelled => "order_cancelled",
            AuditEventType::OrderRejected => "order_rejected",
            AuditEventType::TradeExecuted => "trade_executed",
            AuditEventType::PositionOpened => "position_opened",
            AuditEventType::PositionClosed => "position_closed",
            AuditEventType::UserLogin => "user_login",
            AuditEventType::UserLogout => "user_logout",
            AuditEventType::StrategyStart => "strategy_start",
            AuditEventType::StrategyStop => "strategy_stop",
            AuditEventType::RiskViolation => "risk_violation",
            AuditEventType::SystemStart => "system_start",
            AuditEventType::SystemStop => "system_stop",
            AuditEventType::ConfigChange => "config_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub ip_address: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub status: String,
    pub details: Value,
    pub error_msg: Option<String>,
    pub duration_ms: Option<i64>,
}

impl AuditEvent {
    /// A blank event; `id` and `timestamp` are assigned when written.
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            id: String::new(),
            event_type,
            timestamp: DateTime::<Utc>::default(),
            user_id: None,
            username: None,
            ip_address: None,
            resource: None,
            action: None,
            status: String::new(),
            details: json!({}),
            error_msg: None,
            duration_ms: None,
        }
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn user(mut self, user_id: Option<&str>, username: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self.username = username.map(str::to_string);
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn error(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    /// Attach structured details. A payload that fails to serialize is
    /// replaced by an empty object so the event itself is still written.
    pub fn details<T: Serialize>(mut self, details: &T) -> Self {
        self.details = match serde_json::to_value(details) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(domain = "audit", error = %e, "audit details not serializable, writing {{}}");
                json!({})
            }
        };
        self
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub retention_months: u32,
    pub max_page_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { retention_months: 24, max_page_size: 1000 }
    }
}

/// Query filters; every field is optional.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub event_type: Option<AuditEventType>,
    pub user_id: Option<String>,
    pub resource: Option<String>,
    pub status: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyAction {
    Start,
    Stop,
}

fn partition_key(ts: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

fn generate_id(ts: &DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    format!("{}-{}", ts.format("%Y%m%d%H%M%S"), suffix)
}

pub struct AuditLogger {
    conn: Mutex<Connection>,
    cfg: AuditConfig,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl AuditLogger {
    pub fn open(path: &str, cfg: AuditConfig) -> Result<Self> {
        Self::init(Connection::open(path)?, cfg)
    }

    pub fn open_in_memory(cfg: AuditConfig) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, cfg)
    }

    fn init(conn: Connection, cfg: AuditConfig) -> Result<Self> {
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                event_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                partition_month TEXT NOT NULL,
                user_id TEXT,
                username TEXT,
                ip_address TEXT,
                resource TEXT,
                action TEXT,
                status TEXT NOT NULL,
                details TEXT NOT NULL,
                error_msg TEXT,
                duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_audit_partition ON audit_log (partition_month);
            CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_log (timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_log (resource);
            COMMIT;",
        )?;
        Ok(Self { conn: Mutex::new(conn), cfg, breaker: None })
    }

    /// Route writes through a circuit breaker.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one event, filling id, timestamp and status defaults.
    pub fn log(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        if event.timestamp == DateTime::<Utc>::default() {
            event.timestamp = Utc::now();
        }
        if event.id.is_empty() {
            event.id = generate_id(&event.timestamp);
        }
        if event.status.is_empty() {
            event.status = "success".to_string();
        }
        match &self.breaker {
            Some(b) => b.call(|| self.insert(&event))?,
            None => self.insert(&event)?,
        }
        tracing::debug!(domain = "audit", id = %event.id, event_type = event.event_type.as_str(), "audit event written");
        Ok(event)
    }

    fn insert(&self, event: &AuditEvent) -> Result<()> {
        let details = serde_json::to_string(&event.details).unwrap_or_else(|_| "{}".to_string());
        self.conn().execute(
            "INSERT INTO audit_log (id, event_type, timestamp, partition_month, user_id, username,
                ip_address, resource, action, status, details, error_msg, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.id,
                event.event_type.as_str(),
                event.timestamp.timestamp_millis(),
                partition_key(&event.timestamp),
                event.user_id,
                event.username,
                event.ip_address,
                event.resource,
                event.action,
                event.status,
                details,
                event.error_msg,
                event.duration_ms,
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lifecycle helpers
    // -------------------------------------------------------------------------

    pub fn log_order_created(&self, user_id: Option<&str>, order: &OrderRequest) -> Result<AuditEvent> {
        self.log(
            AuditEvent::new(AuditEventType::OrderCreated)
                .user(user_id, None)
                .resource(format!("order:{}", order.id))
                .action("create")
                .details(order),
        )
    }

    pub fn log_order_filled(&self, fill: &OrderFilled) -> Result<AuditEvent> {
        self.log(
            AuditEvent::new(AuditEventType::OrderFilled)
                .resource(format!("order:{}", fill.order_id))
                .action("fill")
                .details(fill),
        )
    }

    pub fn log_order_rejected(&self, order: &OrderRequest, reasons: &[String]) -> Result<AuditEvent> {
        self.log(
            AuditEvent::new(AuditEventType::OrderRejected)
                .resource(format!("order:{}", order.id))
                .action("reject")
                .status("rejected")
                .error(reasons.join("; "))
                .details(&json!({ "order": order, "reasons": reasons })),
        )
    }

    pub fn log_order_cancelled(&self, order_id: &str, reason: &str) -> Result<AuditEvent> {
        self.log(
            AuditEvent::new(AuditEventType::OrderCancelled)
                .resource(format!("order:{}", order_id))
                .action("cancel")
                .details(&json!({ "reason": reason })),
        )
    }

    pub fn log_trade_executed(
        &self,
        strategy_id: &str,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
        pnl: f64,
    ) -> Result<AuditEvent> {
        self.log(
            AuditEvent::new(AuditEventType::TradeExecuted)
                .resource(format!("strategy:{}", strategy_id))
                .action("trade")
                .details(&json!({
                    "symbol": symbol,
                    "side": side,
                    "quantity": quantity,
                    "price": price,
                    "pnl": pnl,
                })),
        )
    }

    pub fn log_risk_violation(&self, order: &OrderRequest, violations: &[String]) -> Result<AuditEvent> {
        self.log(
            AuditEvent::new(AuditEventType::RiskViolation)
                .resource(format!("order:{}", order.id))
                .action("risk_check")
                .status("violation")
                .error(violations.join("; "))
                .details(&json!({ "symbol": order.symbol, "violations": violations })),
        )
    }

    pub fn log_user_login(&self, user_id: &str, username: &str, ip: Option<&str>, success: bool) -> Result<AuditEvent> {
        let mut ev = AuditEvent::new(AuditEventType::UserLogin)
            .user(Some(user_id), Some(username))
            .resource(format!("user:{}", user_id))
            .action("login")
            .status(if success { "success" } else { "failure" });
        ev.ip_address = ip.map(str::to_string);
        self.log(ev)
    }

    pub fn log_user_logout(&self, user_id: &str, username: &str) -> Result<AuditEvent> {
        self.log(
            AuditEvent::new(AuditEventType::UserLogout)
                .user(Some(user_id), Some(username))
                .resource(format!("user:{}", user_id))
                .action("logout"),
        )
    }

    pub fn log_strategy_action(&self, strategy_id: &str, action: StrategyAction, user_id: Option<&str>) -> Result<AuditEvent> {
        let (event_type, verb) = match action {
            StrategyAction::Start => (AuditEventType::StrategyStart, "start"),
            StrategyAction::Stop => (AuditEventType::StrategyStop, "stop"),
        };
        self.log(
            AuditEvent::new(event_type)
                .user(user_id, None)
                .resource(format!("strategy:{}", strategy_id))
                .action(verb),
        )
    }

    // -------------------------------------------------------------------------
    // Query & retention
    // -------------------------------------------------------------------------

    /// Matching events, newest first, at most `max_page_size`.
    pub fn query(&self, q: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let mut sql = String::from(
            "SELECT id, event_type, timestamp, user_id, username, ip_address, resource, action,
                    status, details, error_msg, duration_ms
             FROM audit_log WHERE 1=1",
        );
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(t) = q.event_type {
            sql.push_str(" AND event_type = ?");
            args.push(t.as_str().to_string().into());
        }
        if let Some(u) = &q.user_id {
            sql.push_str(" AND user_id = ?");
            args.push(u.clone().into());
        }
        if let Some(r) = &q.resource {
            sql.push_str(" AND resource = ?");
            args.push(r.clone().into());
        }
        if let Some(s) = &q.status {
            sql.push_str(" AND status = ?");
            args.push(s.clone().into());
        }
        if let Some(start) = q.start {
            sql.push_str(" AND timestamp >= ?");
            args.push(start.timestamp_millis().into());
        }
        if let Some(end) = q.end {
            sql.push_str(" AND timestamp <= ?");
            args.push(end.timestamp_millis().into());
        }
        let limit = q.limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, self.cfg.max_page_size.max(1));
        sql.push_str(" ORDER BY timestamp DESC, seq DESC LIMIT ?");
        args.push((limit as i64).into());

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_event)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Result<Option<AuditEvent>> {
        let conn = self.conn();
        let ev = conn
            .query_row(
                "SELECT id, event_type, timestamp, user_id, username, ip_address, resource, action,
                        status, details, error_msg, duration_ms
                 FROM audit_log WHERE id = ?1",
                params![id],
                row_to_event,
            )
            .optional()?;
        Ok(ev)
    }

    /// Distinct partitions present, oldest first.
    pub fn partitions(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT partition_month FROM audit_log ORDER BY partition_month")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Drop every partition that ended before the retention window. Returns
    /// the number of events removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let months = now.year() as i64 * 12 + now.month0() as i64 - self.cfg.retention_months as i64;
        let cutoff = Utc
            .with_ymd_and_hms(months.div_euclid(12) as i32, months.rem_euclid(12) as u32 + 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| EngineError::validation("retention cutoff out of range"))?;
        let key = partition_key(&cutoff);
        let removed = self.conn().execute("DELETE FROM audit_log WHERE partition_month < ?1", params![key])?;
        if removed > 0 {
            tracing::info!(domain = "audit", cutoff = %key, removed, "expired audit partitions purged");
        }
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self.conn().query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<AuditEvent> {
    let event_type: String = row.get(1)?;
    let ts_ms: i64 = row.get(2)?;
    let details: String = row.get(9)?;
    Ok(AuditEvent {
        id: row.get(0)?,
        event_type: AuditEventType::parse(&event_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown audit event type {}", event_type).into(),
            )
        })?,
        timestamp: Utc.timestamp_millis_opt(ts_ms).single().unwrap_or_default(),
        user_id: row.get(3)?,
        username: row.get(4)?,
        ip_address: row.get(5)?,
        resource: row.get(6)?,
        action: row.get(7)?,
        status: row.get(8)?,
        details: serde_json::from_str(&details).unwrap_or_else(|_| json!({})),
        error_msg: row.get(10)?,
        duration_ms: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OrderType;
    use serde::Serializer;

    fn order(id: &str) -> OrderRequest {
        OrderRequest {
            id: id.into(),
            strategy_id: "s1".into(),
            symbol: "SPY".into(),
            side: Side::Buy,
            quantity: 10.0,
            price: 100.0,
            order_type: OrderType::Market,
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().unwrap()
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _s: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("nope"))
        }
    }

    #[test]
    fn test_defaults_filled_on_write() {
        let audit = AuditLogger::open_in_memory(AuditConfig::default()).unwrap();
        let ev = audit.log_order_created(Some("u1"), &order("42")).unwrap();
        assert_eq!(ev.status, "success");
        assert_eq!(ev.resource.as_deref(), Some("order:42"));
        assert_eq!(ev.id.len(), "20240101120000-".len() + 8);
        let stored = audit.get(&ev.id).unwrap().unwrap();
        assert_eq!(stored.details["symbol"], "SPY");
    }

    #[test]
    fn test_unserializable_details_written_empty() {
        let audit = AuditLogger::open_in_memory(AuditConfig::default()).unwrap();
        let ev = audit.log(AuditEvent::new(AuditEventType::ConfigChange).details(&Unserializable)).unwrap();
        let stored = audit.get(&ev.id).unwrap().unwrap();
        assert_eq!(stored.details, json!({}));
    }

    #[test]
    fn test_query_by_resource_newest_first() {
        let audit = AuditLogger::open_in_memory(AuditConfig::default()).unwrap();
        for (i, day) in [1u32, 3, 2].iter().enumerate() {
            audit
                .log(
                    AuditEvent::new(AuditEventType::OrderFilled)
                        .resource("order:7")
                        .at(at(2024, 5, *day))
                        .details(&json!({ "i": i })),
                )
                .unwrap();
        }
        audit.log(AuditEvent::new(AuditEventType::OrderFilled).resource("order:8")).unwrap();

        let q = AuditQuery { resource: Some("order:7".into()), ..Default::default() };
        let events = audit.query(&q).unwrap();
        let days: Vec<u32> = events.iter().map(|e| e.timestamp.day()).collect();
        assert_eq!(days, vec![3, 2, 1]);
    }

    #[test]
    fn test_query_filters_and_page_cap() {
        let cfg = AuditConfig { retention_months: 24, max_page_size: 5 };
        let audit = AuditLogger::open_in_memory(cfg).unwrap();
        for _ in 0..8 {
            audit.log_user_login("u1", "alice", Some("10.0.0.1"), true).unwrap();
        }
        audit.log_user_login("u2", "bob", None, false).unwrap();
        audit.log_risk_violation(&order("9"), &["Order size 501 exceeds maximum 500".into()]).unwrap();

        let q = AuditQuery { limit: Some(10_000), ..Default::default() };
        assert_eq!(audit.query(&q).unwrap().len(), 5);

        let q = AuditQuery { status: Some("failure".into()), ..Default::default() };
        let failed = audit.query(&q).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].username.as_deref(), Some("bob"));

        let q = AuditQuery { event_type: Some(AuditEventType::RiskViolation), ..Default::default() };
        let v = audit.query(&q).unwrap();
        assert_eq!(v[0].error_msg.as_deref(), Some("Order size 501 exceeds maximum 500"));
    }

    #[test]
    fn test_time_range_filter() {
        let audit = AuditLogger::open_in_memory(AuditConfig::default()).unwrap();
        for m in 1..=4 {
            audit.log(AuditEvent::new(AuditEventType::SystemStart).at(at(2024, m, 10))).unwrap();
        }
        let q = AuditQuery { start: Some(at(2024, 2, 1)), end: Some(at(2024, 3, 31)), ..Default::default() };
        assert_eq!(audit.query(&q).unwrap().len(), 2);
    }

    #[test]
    fn test_purge_drops_old_partitions() {
        let audit = AuditLogger::open_in_memory(AuditConfig::default()).unwrap();
        audit.log(AuditEvent::new(AuditEventType::SystemStart).at(at(2021, 12, 1))).unwrap();
        audit.log(AuditEvent::new(AuditEventType::SystemStart).at(at(2022, 3, 1))).unwrap();
        audit.log(AuditEvent::new(AuditEventType::SystemStart).at(at(2024, 3, 1))).unwrap();
        assert_eq!(audit.partitions().unwrap(), vec!["2021-12", "2022-03", "2024-03"]);

        // now = 2024-03 -> keep 2022-03 onwards
        let removed = audit.purge_expired(at(2024, 3, 15)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(audit.partitions().unwrap(), vec!["2022-03", "2024-03"]);
    }

    #[test]
    fn test_on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let path = path.to_str().unwrap();
        let id = {
            let audit = AuditLogger::open(path, AuditConfig::default()).unwrap();
            audit.log_strategy_action("ma", StrategyAction::Start, None).unwrap().id
        };
        let audit = AuditLogger::open(path, AuditConfig::default()).unwrap();
        let ev = audit.get(&id).unwrap().unwrap();
        assert_eq!(ev.event_type, AuditEventType::StrategyStart);
        assert_eq!(ev.resource.as_deref(), Some("strategy:ma"));
    }

    #[test]
    fn test_event_type_round_trip_names() {
        for t in AuditEventType::ALL {
            assert_eq!(AuditEventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(AuditEventType::parse("nope"), None);
    }
}
