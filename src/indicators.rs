//! Streaming indicators. Each one folds a price (or bar) at a time and reports readiness once warmed up.
//!
//! Each indicator maintains its own state and is updated one sample at a time.
//! Invalid input (non-positive price or volume, high below low) is rejected
//! with a validation error and leaves the indicator untouched. Before the
//! warm-up window is filled `value()` is 0 and `is_ready()` is false.

use std::collections::VecDeque;

use chrono::NaiveDate;

use crate::error::{EngineError, Result};
use crate::events::Bar;

pub trait Indicator {
    fn update(&mut self, price: f64, ts: i64) -> Result<()>;

    /// Feed a full bar. Close-only indicators use the close.
    fn update_bar(&mut self, bar: &Bar) -> Result<()> {
        bar.validate()?;
        self.update(bar.close, bar.ts)
    }

    fn value(&self) -> f64;
    fn is_ready(&self) -> bool;
    fn reset(&mut self);
}

fn check_price(price: f64) -> Result<()> {
    if price > 0.0 && price.is_finite() {
        Ok(())
    } else {
        Err(EngineError::validation(format!("price must be positive, got {}", price)))
    }
}

// =============================================================================
// Moving Averages
// =============================================================================

/// Rolling arithmetic mean over the last `period` values.
#[derive(Debug, Clone)]
pub struct Sma {
    window: VecDeque<f64>,
    period: usize,
    sum: f64,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        let period = if period < 1 { 20 } else { period };
        Self {
            window: VecDeque::with_capacity(period + 1),
            period,
            sum: 0.0,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.sum -= self.window.pop_front().unwrap_or(0.0);
        }
    }
}

impl Indicator for Sma {
    fn update(&mut self, price: f64, _ts: i64) -> Result<()> {
        check_price(price)?;
        self.push(price);
        Ok(())
    }

    fn value(&self) -> f64 {
        if !self.is_ready() {
            return 0.0;
        }
        self.sum / self.period as f64
    }

    fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}

/// Exponential moving average, seeded with the SMA of the first `period` samples.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    k: f64,
    value: f64,
    seed_sum: f64,
    count: usize,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = if period < 1 { 20 } else { period };
        Self {
            period,
            k: 2.0 / (period as f64 + 1.0),
            value: 0.0,
            seed_sum: 0.0,
            count: 0,
        }
    }

    // Unchecked: MACD feeds signed differences through here.
    fn push(&mut self, x: f64) {
        self.count += 1;
        if self.count < self.period {
            self.seed_sum += x;
        } else if self.count == self.period {
            self.seed_sum += x;
            self.value = self.seed_sum / self.period as f64;
        } else {
            self.value = (x - self.value) * self.k + self.value;
        }
    }
}

impl Indicator for Ema {
    fn update(&mut self, price: f64, _ts: i64) -> Result<()> {
        check_price(price)?;
        self.push(price);
        Ok(())
    }

    fn value(&self) -> f64 {
        if self.is_ready() {
            self.value
        } else {
            0.0
        }
    }

    fn is_ready(&self) -> bool {
        self.count >= self.period
    }

    fn reset(&mut self) {
        self.value = 0.0;
        self.seed_sum = 0.0;
        self.count = 0;
    }
}

// =============================================================================
// Oscillators
// =============================================================================

/// Relative Strength Index with Wilder smoothing
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev: Option<f64>,
    changes: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        let period = if period < 2 { 14 } else { period };
        Self { period, prev: None, changes: 0, avg_gain: 0.0, avg_loss: 0.0 }
    }

    pub fn is_oversold(&self, threshold: f64) -> bool {
        self.is_ready() && self.value() < threshold
    }

    pub fn is_overbought(&self, threshold: f64) -> bool {
        self.is_ready() && self.value() > threshold
    }
}

impl Indicator for Rsi {
    fn update(&mut self, price: f64, _ts: i64) -> Result<()> {
        check_price(price)?;
        let Some(prev) = self.prev.replace(price) else {
            return Ok(());
        };
        let change = price - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        self.changes += 1;
        let n = self.period as f64;

        if self.changes <= self.period {
            // Accumulate, then average once the first window is complete.
            self.avg_gain += gain;
            self.avg_loss += loss;
            if self.changes == self.period {
                self.avg_gain /= n;
                self.avg_loss /= n;
            }
        } else {
            self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
        }
        Ok(())
    }

    fn value(&self) -> f64 {
        if !self.is_ready() {
            return 0.0;
        }
        // No losses in the window reads as maximum strength, flat windows included.
        if self.avg_loss == 0.0 {
            return 100.0;
        }
        let rs = self.avg_gain / self.avg_loss;
        (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
    }

    fn is_ready(&self) -> bool {
        self.changes >= self.period
    }

    fn reset(&mut self) {
        self.prev = None;
        self.changes = 0;
        self.avg_gain = 0.0;
        self.avg_loss = 0.0;
    }
}

/// MACD line, signal line and histogram.
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
    line: f64,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        let fast = if fast < 1 { 12 } else { fast };
        let slow = if slow < 1 { 26 } else { slow };
        let signal = if signal < 1 { 9 } else { signal };
        Self { fast: Ema::new(fast), slow: Ema::new(slow), signal: Ema::new(signal), line: 0.0 }
    }

    pub fn signal(&self) -> f64 {
        if self.is_ready() {
            self.signal.value
        } else {
            0.0
        }
    }

    pub fn histogram(&self) -> f64 {
        if self.is_ready() {
            self.line - self.signal.value
        } else {
            0.0
        }
    }
}

impl Default for Macd {
    fn default() -> Self {
        Self::new(12, 26, 9)
    }
}

impl Indicator for Macd {
    fn update(&mut self, price: f64, ts: i64) -> Result<()> {
        check_price(price)?;
        self.fast.update(price, ts)?;
        self.slow.update(price, ts)?;
        if self.fast.is_ready() && self.slow.is_ready() {
            self.line = self.fast.value - self.slow.value;
            self.signal.push(self.line);
        }
        Ok(())
    }

    fn value(&self) -> f64 {
        if self.is_ready() {
            self.line
        } else {
            0.0
        }
    }

    fn is_ready(&self) -> bool {
        self.slow.is_ready() && self.fast.is_ready() && self.signal.is_ready()
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
        self.line = 0.0;
    }
}

// =============================================================================
// Volatility
// =============================================================================

/// Bollinger Bands: SMA middle, +/- k population standard deviations.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    window: VecDeque<f64>,
    period: usize,
    k: f64,
    middle: f64,
    std_dev: f64,
}

impl BollingerBands {
    pub fn new(period: usize, k: f64) -> Self {
        let k = if k <= 0.0 { 2.0 } else { k };
        Self::with_raw_multiplier(period, k)
    }

    /// Like `new` but keeps `k` as given (negative is treated as zero).
    pub fn with_raw_multiplier(period: usize, k: f64) -> Self {
        let period = if period < 2 { 20 } else { period };
        Self {
            window: VecDeque::with_capacity(period + 1),
            period,
            k: k.max(0.0),
            middle: 0.0,
            std_dev: 0.0,
        }
    }

    pub fn upper(&self) -> f64 {
        if self.is_ready() {
            self.middle + self.k * self.std_dev
        } else {
            0.0
        }
    }

    pub fn middle(&self) -> f64 {
        if self.is_ready() {
            self.middle
        } else {
            0.0
        }
    }

    pub fn lower(&self) -> f64 {
        if self.is_ready() {
            self.middle - self.k * self.std_dev
        } else {
            0.0
        }
    }

    /// Position of `price` within the bands: 0 at lower, 1 at upper.
    pub fn percent_b(&self, price: f64) -> f64 {
        let width = self.upper() - self.lower();
        if !self.is_ready() || width <= 0.0 {
            return 0.5;
        }
        (price - self.lower()) / width
    }

    pub fn bandwidth(&self) -> f64 {
        self.upper() - self.lower()
    }

    pub fn is_below_lower(&self, price: f64) -> bool {
        self.is_ready() && price < self.lower()
    }

    pub fn is_above_upper(&self, price: f64) -> bool {
        self.is_ready() && price > self.upper()
    }
}

impl Indicator for BollingerBands {
    fn update(&mut self, price: f64, _ts: i64) -> Result<()> {
        check_price(price)?;
        self.window.push_back(price);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        if self.window.len() >= self.period {
            let n = self.window.len() as f64;
            self.middle = self.window.iter().sum::<f64>() / n;
            let var = self.window.iter().map(|x| (x - self.middle).powi(2)).sum::<f64>() / n;
            self.std_dev = var.max(0.0).sqrt();
        }
        Ok(())
    }

    /// The middle band.
    fn value(&self) -> f64 {
        self.middle()
    }

    fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }

    fn reset(&mut self) {
        self.window.clear();
        self.middle = 0.0;
        self.std_dev = 0.0;
    }
}

/// Average True Range with Wilder smoothing
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    prev_close: Option<f64>,
    count: usize,
    tr_sum: f64,
    value: f64,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        let period = if period < 1 { 14 } else { period };
        Self { period, prev_close: None, count: 0, tr_sum: 0.0, value: 0.0 }
    }

    fn push_range(&mut self, high: f64, low: f64, close: f64) {
        let tr = match self.prev_close {
            None => high - low,
            Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
        };
        self.prev_close = Some(close);
        self.count += 1;
        let n = self.period as f64;
        if self.count < self.period {
            self.tr_sum += tr;
        } else if self.count == self.period {
            self.tr_sum += tr;
            self.value = self.tr_sum / n;
        } else {
            self.value = (self.value * (n - 1.0) + tr) / n;
        }
    }
}

impl Indicator for Atr {
    /// Close-only update: treated as a bar with high == low == close.
    fn update(&mut self, price: f64, _ts: i64) -> Result<()> {
        check_price(price)?;
        self.push_range(price, price, price);
        Ok(())
    }

    fn update_bar(&mut self, bar: &Bar) -> Result<()> {
        bar.validate()?;
        self.push_range(bar.high, bar.low, bar.close);
        Ok(())
    }

    fn value(&self) -> f64 {
        if self.is_ready() {
            self.value
        } else {
            0.0
        }
    }

    fn is_ready(&self) -> bool {
        self.count >= self.period
    }

    fn reset(&mut self) {
        self.prev_close = None;
        self.count = 0;
        self.tr_sum = 0.0;
        self.value = 0.0;
    }
}

// =============================================================================
// Volume
// =============================================================================

/// Session VWAP; resets when the bar's UTC date changes.
#[derive(Debug, Clone, Default)]
pub struct Vwap {
    cum_pv: f64,
    cum_volume: f64,
    session: Option<NaiveDate>,
}

impl Vwap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Percent distance of `price` from VWAP (positive = above).
    pub fn distance_pct(&self, price: f64) -> f64 {
        let v = self.value();
        if v <= 0.0 {
            return 0.0;
        }
        (price - v) / v * 100.0
    }

    pub fn session(&self) -> Option<NaiveDate> {
        self.session
    }
}

impl Indicator for Vwap {
    fn update(&mut self, _price: f64, _ts: i64) -> Result<()> {
        Err(EngineError::validation("VWAP needs volume; feed it with update_bar"))
    }

    fn update_bar(&mut self, bar: &Bar) -> Result<()> {
        bar.validate()?;
        if bar.volume <= 0.0 {
            return Err(EngineError::validation(format!("volume must be positive, got {}", bar.volume)));
        }
        let date = bar.date();
        if self.session != Some(date) {
            self.cum_pv = 0.0;
            self.cum_volume = 0.0;
            self.session = Some(date);
        }
        self.cum_pv += bar.typical_price() * bar.volume;
        self.cum_volume += bar.volume;
        Ok(())
    }

    fn value(&self) -> f64 {
        if self.cum_volume > 0.0 {
            self.cum_pv / self.cum_volume
        } else {
            0.0
        }
    }

    fn is_ready(&self) -> bool {
        self.cum_volume > 0.0
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
