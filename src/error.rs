//! Error taxonomy shared by every component.
//!
//! Each variant maps onto one `ErrorKind` so callers can branch on the kind
//! while humans read the message.

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Machine-checkable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RiskRejection,
    RiskWarning,
    TransientInfrastructure,
    CircuitOpen,
    SimulationConfiguration,
    Cancelled,
    Storage,
    Serialization,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RiskRejection => "risk_rejection",
            ErrorKind::RiskWarning => "risk_warning",
            ErrorKind::TransientInfrastructure => "transient_infrastructure",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::SimulationConfiguration => "simulation_configuration",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed input (non-positive price, high < low, stale bar, ...)
    #[error("validation error: {0}")]
    Validation(String),

    /// One or more hard risk limits violated
    #[error("order rejected by risk checks: {}", .0.join("; "))]
    RiskRejection(Vec<String>),

    /// Soft limit violated; the order may still proceed
    #[error("risk warning: {}", .0.join("; "))]
    RiskWarning(Vec<String>),

    /// Downstream dependency failed; candidate for circuit breaking
    #[error("transient infrastructure failure: {0}")]
    TransientInfrastructure(String),

    /// Call short-circuited by an open (or saturated half-open) breaker
    #[error("circuit breaker '{name}' rejected call: {reason}")]
    CircuitOpen { name: String, reason: String },

    /// Fatal for a single simulation run
    #[error("simulation configuration error: {0}")]
    SimulationConfiguration(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::RiskRejection(_) => ErrorKind::RiskRejection,
            EngineError::RiskWarning(_) => ErrorKind::RiskWarning,
            EngineError::TransientInfrastructure(_) => ErrorKind::TransientInfrastructure,
            EngineError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            EngineError::SimulationConfiguration(_) => ErrorKind::SimulationConfiguration,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Serialization(_) => ErrorKind::Serialization,
            EngineError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether a caller may try again later (only infrastructure failures qualify).
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientInfrastructure | ErrorKind::CircuitOpen | ErrorKind::Storage
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::SimulationConfiguration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EngineError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(EngineError::config("x").kind(), ErrorKind::SimulationConfiguration);
        let err = EngineError::CircuitOpen { name: "db".into(), reason: "open".into() };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(err.is_transient());
        assert!(!EngineError::validation("bad price").is_transient());
    }

    #[test]
    fn test_rejection_message_joins_reasons() {
        let err = EngineError::RiskRejection(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "order rejected by risk checks: a; b");
        assert_eq!(err.kind().as_str(), "risk_rejection");
    }
}
