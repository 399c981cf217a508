//! Structured logging for the decision engine.
//!
//! Every event carries a `domain` field so log streams can be filtered per
//! concern (market data, strategy, risk, ...). Output is plain text by default
//! or JSON lines with `LOG_FORMAT=json`.

use serde::Serialize;
use tracing_subscriber::EnvFilter;

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Market,    // Bars, indicators
    Strategy,  // Signal generation, lifecycle
    Risk,      // Limit checks
    Exec,      // Order submission
    Fill,      // Fill processing
    System,    // Startup, shutdown, breakers, bus
    Audit,     // Audit trail writes
    Optimizer, // Sweeps, walk-forward, Monte Carlo
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Market => "market",
            Domain::Strategy => "strategy",
            Domain::Risk => "risk",
            Domain::Exec => "exec",
            Domain::Fill => "fill",
            Domain::System => "system",
            Domain::Audit => "audit",
            Domain::Optimizer => "optimizer",
        }
    }
}

// =============================================================================
// Subscriber setup
// =============================================================================

/// Install the global subscriber. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    });
    let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));

    let result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    // Already installed (tests, embedding binaries) is fine.
    let _ = result;
}

// =============================================================================
// Domain helpers
// =============================================================================

pub fn log_signal(strategy_id: &str, symbol: &str, action: &str, confidence: f64, reason: &str) {
    tracing::debug!(
        domain = Domain::Strategy.as_str(),
        strategy_id,
        symbol,
        action,
        confidence,
        reason,
        "signal"
    );
}

pub fn log_risk_check(symbol: &str, approved: bool, rejections: usize, warnings: usize, score: f64) {
    if approved {
        tracing::debug!(
            domain = Domain::Risk.as_str(),
            symbol,
            approved,
            rejections,
            warnings,
            score,
            "risk check"
        );
    } else {
        tracing::warn!(
            domain = Domain::Risk.as_str(),
            symbol,
            approved,
            rejections,
            warnings,
            score,
            "risk check rejected order"
        );
    }
}

pub fn log_fill(strategy_id: &str, symbol: &str, side: &str, qty: f64, price: f64, ts: i64) {
    tracing::info!(
        domain = Domain::Fill.as_str(),
        strategy_id,
        symbol,
        side,
        qty,
        price,
        ts,
        "fill"
    );
}

pub fn log_breaker_transition(name: &str, from: &str, to: &str) {
    tracing::info!(domain = Domain::System.as_str(), breaker = name, from, to, "circuit state change");
}

pub fn log_dropped_event(event_type: &str, subscriber_id: u64, buffer_size: usize) {
    tracing::warn!(
        domain = Domain::System.as_str(),
        event_type,
        subscriber_id,
        buffer_size,
        "subscriber buffer full, event dropped"
    );
}

pub fn log_stale_bar(strategy_id: &str, symbol: &str, ts: i64, last_ts: i64) {
    tracing::warn!(
        domain = Domain::Market.as_str(),
        strategy_id,
        symbol,
        ts,
        last_ts,
        "bar older than last seen, rejected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        log_signal("s1", "SPY", "BUY", 0.75, "test");
        log_risk_check("SPY", false, 1, 0, 0.8);
    }

    #[test]
    fn test_domain_names() {
        assert_eq!(Domain::Optimizer.as_str(), "optimizer");
        assert_eq!(serde_json::to_string(&Domain::Fill).unwrap_or_default(), "\"fill\"");
    }
}
