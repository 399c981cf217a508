pub mod circuit;

pub use circuit::{BreakerMetrics, CircuitBreaker, CircuitConfig, CircuitManager, CircuitState};
