//! Opening range breakout.
//!
//! Session times are read from the bar timestamp's UTC clock, so feeds should
//! carry exchange-local timestamps. One entry per day; any open position is
//! closed at the end-of-day exit time.

use std::collections::HashMap;

use chrono::{NaiveDate, Timelike};

use super::{Holding, Strategy, DEFAULT_QUANTITY};
use crate::error::Result;
use crate::events::{Bar, OrderFilled, Side, Signal};
use crate::indicators::{Atr, Indicator};

const SESSION_OPEN_MIN: u32 = 9 * 60 + 30;
const SESSION_EXIT_MIN: u32 = 15 * 60 + 55;

#[derive(Debug)]
struct SymbolState {
    atr: Atr,
    day: Option<NaiveDate>,
    range_high: Option<f64>,
    range_low: Option<f64>,
    range_complete: bool,
    traded_today: bool,
    stop: f64,
    holding: Holding,
}

impl SymbolState {
    fn new_day(&mut self, day: NaiveDate) {
        self.day = Some(day);
        self.range_high = None;
        self.range_low = None;
        self.range_complete = false;
        self.traded_today = false;
    }
}

#[derive(Debug)]
pub struct OpeningRange {
    id: String,
    symbols: Vec<String>,
    range_minutes: u32,
    atr_period: usize,
    quantity: f64,
    state: HashMap<String, SymbolState>,
}

impl OpeningRange {
    /// `range_minutes` must be 15 or 30; anything else falls back to 15.
    pub fn new(id: &str, symbols: Vec<String>, range_minutes: i64, atr_period: usize) -> Self {
        let range_minutes = if range_minutes == 30 { 30 } else { 15 };
        Self {
            id: id.to_string(),
            symbols,
            range_minutes,
            atr_period,
            quantity: DEFAULT_QUANTITY,
            state: HashMap::new(),
        }
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn range_minutes(&self) -> u32 {
        self.range_minutes
    }
}

impl Strategy for OpeningRange {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Opening Range Breakout"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn initialize(&mut self) -> Result<()> {
        for s in &self.symbols {
            self.state.insert(
                s.clone(),
                SymbolState {
                    atr: Atr::new(self.atr_period),
                    day: None,
                    range_high: None,
                    range_low: None,
                    range_complete: false,
                    traded_today: false,
                    stop: 0.0,
                    holding: Holding::default(),
                },
            );
        }
        Ok(())
    }

    fn on_market_data(&mut self, bar: &Bar) -> Result<Option<Signal>> {
        let Some(st) = self.state.get_mut(&bar.symbol) else {
            return Ok(None);
        };
        st.atr.update_bar(bar)?;
        let dt = bar.datetime();
        let day = dt.date_naive();
        if st.day != Some(day) {
            st.new_day(day);
        }
        let minute = dt.hour() * 60 + dt.minute();
        if minute < SESSION_OPEN_MIN {
            return Ok(None);
        }
        if minute < SESSION_OPEN_MIN + self.range_minutes {
            st.range_high = Some(st.range_high.map_or(bar.high, |h| h.max(bar.high)));
            st.range_low = Some(st.range_low.map_or(bar.low, |l| l.min(bar.low)));
            return Ok(None);
        }
        if !st.range_complete {
            st.range_complete = st.range_high.is_some();
        }

        if st.holding.long {
            if minute >= SESSION_EXIT_MIN {
                st.holding.close();
                return Ok(Some(Signal::new(&self.id, bar, Side::Sell, 0.95, self.quantity, "End of day exit".into())));
            }
            if bar.close < st.stop {
                let reason = format!("Stop loss hit: {:.2} < {:.2}", bar.close, st.stop);
                st.holding.close();
                return Ok(Some(Signal::new(&self.id, bar, Side::Sell, 0.90, self.quantity, reason)));
            }
            return Ok(None);
        }

        let (Some(high), Some(low)) = (st.range_high, st.range_low) else {
            return Ok(None);
        };
        if st.range_complete && minute < SESSION_EXIT_MIN && !st.traded_today && bar.close > high {
            st.stop = if st.atr.is_ready() { low.max(bar.close - st.atr.value()) } else { low };
            st.traded_today = true;
            st.holding.open(bar.close);
            let reason = format!(
                "Breakout above {}m range high {:.2} (low {:.2}, stop {:.2})",
                self.range_minutes, high, low, st.stop
            );
            return Ok(Some(Signal::new(&self.id, bar, Side::Buy, 0.80, self.quantity, reason)));
        }
        Ok(None)
    }

    fn on_order_filled(&mut self, fill: &OrderFilled) -> Result<()> {
        if let Some(st) = self.state.get_mut(&fill.symbol) {
            st.holding.apply_fill(fill);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 1_709_596_800; // 2024-03-05 00:00 UTC

    fn bar(minute: i64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new("SPY", DAY + minute * 60, close, high, low, close, 1000.0)
    }

    fn orb() -> OpeningRange {
        let mut s = OpeningRange::new("orb", vec!["SPY".into()], 15, 14);
        s.initialize().unwrap();
        s
    }

    #[test]
    fn test_breakout_once_then_end_of_day_exit() {
        let mut s = orb();
        let open = SESSION_OPEN_MIN as i64;
        for m in 0..15 {
            assert!(s.on_market_data(&bar(open + m, 101.0, 99.0, 100.0)).unwrap().is_none());
        }
        assert!(s.on_market_data(&bar(open + 15, 100.5, 99.5, 100.0)).unwrap().is_none());
        let buy = s.on_market_data(&bar(open + 16, 102.0, 100.0, 101.5)).unwrap().unwrap();
        assert_eq!(buy.side, Side::Buy);

        let exit_min = SESSION_EXIT_MIN as i64;
        assert!(s.on_market_data(&bar(exit_min - 1, 102.0, 101.0, 101.8)).unwrap().is_none());
        let sell = s.on_market_data(&bar(exit_min, 102.0, 101.0, 101.8)).unwrap().unwrap();
        assert_eq!(sell.side, Side::Sell);
        assert_eq!(sell.reason, "End of day exit");

        // Already traded today.
        assert!(s.on_market_data(&bar(exit_min + 1, 105.0, 104.0, 104.5)).unwrap().is_none());
    }

    #[test]
    fn test_stop_loss_exit() {
        let mut s = orb();
        let open = SESSION_OPEN_MIN as i64;
        for m in 0..15 {
            s.on_market_data(&bar(open + m, 101.0, 99.0, 100.0)).unwrap();
        }
        assert!(s.on_market_data(&bar(open + 15, 101.5, 100.5, 101.2)).unwrap().is_some());
        let sell = s.on_market_data(&bar(open + 16, 99.5, 98.0, 98.5)).unwrap().unwrap();
        assert_eq!(sell.side, Side::Sell);
        assert!(sell.reason.starts_with("Stop loss"));
    }

    #[test]
    fn test_range_minutes_fallback() {
        assert_eq!(OpeningRange::new("o", vec![], 30, 14).range_minutes(), 30);
        assert_eq!(OpeningRange::new("o", vec![], 45, 14).range_minutes(), 15);
    }
}
