//! tradecore: strategy, risk and backtest engine for bar-driven trading.
//!
//! Market bars flow over an in-process [`bus::EventBus`] into strategies,
//! which emit signals. Signals pass the [`risk::RiskManager`] before an
//! order gateway sees them, every order decision lands in the
//! [`audit::AuditLogger`], and the same strategy code is replayed by the
//! [`backtest::BacktestEngine`] and searched over by the [`optimizer`].

pub mod audit;
pub mod backtest;
pub mod bus;
pub mod cancel;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod indicators;
pub mod logging;
pub mod optimizer;
pub mod params;
pub mod portfolio;
pub mod reliability;
pub mod report;
pub mod risk;
pub mod router;
pub mod strategy;

pub use error::{EngineError, ErrorKind, Result};
