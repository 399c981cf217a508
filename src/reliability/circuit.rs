//! Circuit breaker with Closed / Open / HalfOpen states, plus a named registry.
//!
//! Closed: calls pass; consecutive failures are counted and reaching
//! `max_failures` opens the breaker. Open: calls fail immediately until
//! `timeout` has elapsed, then the breaker moves to HalfOpen. HalfOpen: at most
//! `max_requests` trial calls are admitted; any failure re-opens, and
//! `max_requests` successes close it again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::logging::log_breaker_transition;

// =============================================================================
// Clock
// =============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { base: Instant::now(), offset: Mutex::new(Duration::ZERO) }
    }

    pub fn advance(&self, by: Duration) {
        let mut off = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *off += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let off = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.base + *off
    }
}

// =============================================================================
// Breaker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub max_failures: u32,
    pub timeout: Duration,
    pub max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { max_failures: 5, timeout: Duration::from_secs(30), max_requests: 3 }
    }
}

impl CircuitConfig {
    /// Tighter settings for storage calls
    pub fn database() -> Self {
        Self { max_failures: 3, timeout: Duration::from_secs(10), max_requests: 2 }
    }

    /// Settings for third-party APIs (brokers, data vendors)
    pub fn external_api() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub since_state_change_ms: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    consecutive_successes: u32,
    trials_admitted: u32,
    last_state_change: Instant,
}

pub struct CircuitBreaker {
    name: String,
    cfg: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("name", &self.name).field("cfg", &self.cfg).finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: &str, cfg: CircuitConfig) -> Self {
        Self::with_clock(name, cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(name: &str, cfg: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        let cfg = CircuitConfig {
            max_failures: cfg.max_failures.max(1),
            max_requests: cfg.max_requests.max(1),
            ..cfg
        };
        let now = clock.now();
        Self {
            name: name.to_string(),
            cfg,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                consecutive_successes: 0,
                trials_admitted: 0,
                last_state_change: now,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        log_breaker_transition(&self.name, inner.state.as_str(), to.as_str());
        inner.state = to;
        inner.last_state_change = self.clock.now();
        inner.consecutive_successes = 0;
        inner.trials_admitted = 0;
        if to == CircuitState::Closed {
            inner.failures = 0;
        }
    }

    // Open -> HalfOpen once the cooldown has passed.
    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && self.clock.now().duration_since(inner.last_state_change) >= self.cfg.timeout
        {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Admit one call or fail fast. Every admitted call must be followed by
    /// `record_success` or `record_failure`.
    pub fn acquire(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(EngineError::CircuitOpen {
                name: self.name.clone(),
                reason: "circuit open".to_string(),
            }),
            CircuitState::HalfOpen => {
                if inner.trials_admitted >= self.cfg.max_requests {
                    return Err(EngineError::CircuitOpen {
                        name: self.name.clone(),
                        reason: "half-open limit reached".to_string(),
                    });
                }
                inner.trials_admitted += 1;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.cfg.max_requests {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.cfg.max_failures {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.failures += 1;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker.
    pub fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.acquire()?;
        let out = f();
        match &out {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        out
    }

    /// Async variant of `call`; the future is only created once admitted.
    pub async fn call_async<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire()?;
        let out = f().await;
        match &out {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        out
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failures = 0;
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let in_flight = if inner.state == CircuitState::HalfOpen {
            inner.trials_admitted.saturating_sub(inner.consecutive_successes)
        } else {
            0
        };
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_in_flight: in_flight,
            since_state_change_ms: self.clock.now().duration_since(inner.last_state_change).as_millis() as u64,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Registry of breakers keyed by resource name.
pub struct CircuitManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { breakers: RwLock::new(HashMap::new()), clock }
    }

    /// Return the breaker for `name`, creating it with `cfg` on first use.
    pub fn get_or_create(&self, name: &str, cfg: CircuitConfig) -> Arc<CircuitBreaker> {
        {
            let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(b) = map.get(name) {
                return Arc::clone(b);
            }
        }
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        // Re-check: another thread may have created it between the locks.
        let breaker = map
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_clock(name, cfg, Arc::clone(&self.clock))));
        Arc::clone(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_metrics(&self) -> Vec<BreakerMetrics> {
        let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<BreakerMetrics> = map.values().map(|b| b.metrics()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
