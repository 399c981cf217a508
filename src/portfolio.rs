//! Position and cash bookkeeping, and the read-side view the risk checks use.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::{OrderFilled, Side};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
    pub last_price: f64,
}

impl Position {
    pub fn market_value(&self) -> f64 {
        self.quantity * self.last_price
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.last_price - self.avg_price) * self.quantity
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub cash: f64,
    pub total_value: f64,
    pub exposure: f64,
    pub positions: Vec<Position>,
}

/// Read access to portfolio state. Implemented in-process for backtests and
/// by repository adapters in a live deployment.
pub trait PortfolioProvider: Send + Sync {
    fn position(&self, symbol: &str) -> Option<Position>;
    fn summary(&self) -> Result<PortfolioSummary>;
}

#[derive(Debug, Clone, Default)]
struct Book {
    cash: f64,
    positions: BTreeMap<String, Position>,
}

impl Book {
    /// Returns realized P&L of the closed portion.
    fn apply_fill(&mut self, fill: &OrderFilled) -> f64 {
        if fill.quantity == 0.0 {
            return 0.0;
        }
        let signed = match fill.side {
            Side::Buy => fill.quantity.abs(),
            Side::Sell => -fill.quantity.abs(),
        };
        let pos = self.positions.entry(fill.symbol.clone()).or_insert_with(|| Position {
            symbol: fill.symbol.clone(),
            ..Default::default()
        });
        let prev = pos.quantity;
        let next = prev + signed;
        let mut realized = 0.0;

        if prev != 0.0 && prev.signum() != signed.signum() {
            let closed = prev.abs().min(signed.abs());
            realized = (fill.price - pos.avg_price) * closed * prev.signum();
        }

        self.cash -= fill.price * signed + fill.commission;

        if prev == 0.0 || (next != 0.0 && prev.signum() != next.signum()) {
            pos.avg_price = fill.price;
        } else if next.abs() > prev.abs() {
            pos.avg_price = (pos.avg_price * prev.abs() + fill.price * signed.abs()) / next.abs();
        }
        pos.quantity = next;
        pos.last_price = fill.price;

        if next == 0.0 {
            self.positions.remove(&fill.symbol);
        }
        realized
    }

    fn summary(&self) -> PortfolioSummary {
        let positions: Vec<Position> = self.positions.values().cloned().collect();
        let value: f64 = positions.iter().map(|p| p.market_value()).sum();
        let exposure: f64 = positions.iter().map(|p| p.market_value().abs()).sum();
        PortfolioSummary { cash: self.cash, total_value: self.cash + value, exposure, positions }
    }
}

/// Thread-safe in-memory portfolio.
#[derive(Debug, Default)]
pub struct InMemoryPortfolio {
    book: RwLock<Book>,
}

impl InMemoryPortfolio {
    pub fn new(cash: f64) -> Self {
        Self { book: RwLock::new(Book { cash, positions: BTreeMap::new() }) }
    }

    pub fn apply_fill(&self, fill: &OrderFilled) -> f64 {
        let mut book = self.book.write().unwrap_or_else(|e| e.into_inner());
        book.apply_fill(fill)
    }

    /// Update the mark price used for valuation.
    pub fn mark(&self, symbol: &str, price: f64) {
        let mut book = self.book.write().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = book.positions.get_mut(symbol) {
            p.last_price = price;
        }
    }

    pub fn cash(&self) -> f64 {
        self.book.read().unwrap_or_else(|e| e.into_inner()).cash
    }

    pub fn set_cash(&self, cash: f64) {
        self.book.write().unwrap_or_else(|e| e.into_inner()).cash = cash;
    }
}

impl PortfolioProvider for InMemoryPortfolio {
    fn position(&self, symbol: &str) -> Option<Position> {
        let book = self.book.read().unwrap_or_else(|e| e.into_inner());
        book.positions.get(symbol).cloned()
    }

    fn summary(&self) -> Result<PortfolioSummary> {
        let book = self.book.read().unwrap_or_else(|e| e.into_inner());
        Ok(book.summary())
    }
}
