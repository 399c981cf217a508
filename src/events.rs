//! Event payloads carried on the bus.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MarketData,
    Signal,
    Order,
    OrderFilled,
    PortfolioUpdate,
    SystemStatus,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MarketData => "market_data",
            EventType::Signal => "signal",
            EventType::Order => "order",
            EventType::OrderFilled => "order_filled",
            EventType::PortfolioUpdate => "portfolio_update",
            EventType::SystemStatus => "system_status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// One OHLCV bar. `ts` is epoch seconds (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(symbol: &str, ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self { symbol: symbol.to_string(), ts, open, high, low, close, volume }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(EngineError::validation("bar has empty symbol"));
        }
        for (name, v) in [("open", self.open), ("high", self.high), ("low", self.low), ("close", self.close)] {
            if !(v > 0.0) || !v.is_finite() {
                return Err(EngineError::validation(format!("{} price must be positive, got {}", name, v)));
            }
        }
        if self.high < self.low {
            return Err(EngineError::validation(format!(
                "high {} below low {}",
                self.high, self.low
            )));
        }
        if self.volume < 0.0 {
            return Err(EngineError::validation(format!("negative volume {}", self.volume)));
        }
        Ok(())
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        ts_to_datetime(self.ts)
    }

    pub fn date(&self) -> NaiveDate {
        self.datetime().date_naive()
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

pub fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_default()
}

/// A strategy's trade recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    pub confidence: f64,
    pub quantity: f64,
    pub price: f64,
    pub reason: String,
    pub ts: i64,
}

impl Signal {
    pub fn new(strategy_id: &str, bar: &Bar, side: Side, confidence: f64, quantity: f64, reason: String) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            symbol: bar.symbol.clone(),
            side,
            confidence: confidence.clamp(0.0, 1.0),
            quantity,
            price: bar.close,
            reason,
            ts: bar.ts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub order_type: OrderType,
}

impl OrderRequest {
    pub fn from_signal(id: String, signal: &Signal) -> Self {
        Self {
            id,
            strategy_id: signal.strategy_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity: signal.quantity,
            price: signal.price,
            order_type: OrderType::Market,
        }
    }

    pub fn notional(&self) -> f64 {
        self.quantity * self.price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFilled {
    pub order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioUpdate {
    pub cash: f64,
    pub total_value: f64,
    pub exposure: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub component: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MarketData(Bar),
    Signal(Signal),
    Order(OrderRequest),
    OrderFilled(OrderFilled),
    PortfolioUpdate(PortfolioUpdate),
    SystemStatus(SystemStatus),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::MarketData(_) => EventType::MarketData,
            Event::Signal(_) => EventType::Signal,
            Event::Order(_) => EventType::Order,
            Event::OrderFilled(_) => EventType::OrderFilled,
            Event::PortfolioUpdate(_) => EventType::PortfolioUpdate,
            Event::SystemStatus(_) => EventType::SystemStatus,
        }
    }

    pub fn status(component: &str, status: &str, message: &str) -> Self {
        Event::SystemStatus(SystemStatus {
            component: component.to_string(),
            status: status.to_string(),
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_validation() {
        assert!(Bar::new("SPY", 0, 10.0, 11.0, 9.0, 10.5, 100.0).validate().is_ok());
        assert!(Bar::new("SPY", 0, 10.0, 9.0, 11.0, 10.5, 100.0).validate().is_err());
        assert!(Bar::new("SPY", 0, 10.0, 11.0, 9.0, 0.0, 100.0).validate().is_err());
        assert!(Bar::new("", 0, 10.0, 11.0, 9.0, 10.0, 100.0).validate().is_err());
    }

    #[test]
    fn test_event_type_tags() {
        let ev = Event::status("engine", "RUNNING", "up");
        assert_eq!(ev.event_type(), EventType::SystemStatus);
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"system_status\""));
    }

    #[test]
    fn test_signal_confidence_clamped() {
        let bar = Bar::new("SPY", 60, 1.0, 1.0, 1.0, 1.0, 1.0);
        let s = Signal::new("s", &bar, Side::Buy, 1.7, 100.0, "x".into());
        assert_eq!(s.confidence, 1.0);
        assert_eq!(s.ts, 60);
    }
}
