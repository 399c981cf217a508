//! VWAP pullback entries in an uptrend, exits on target, trend loss or stop.

use std::collections::HashMap;

use super::{Holding, Strategy, DEFAULT_QUANTITY};
use crate::error::Result;
use crate::events::{Bar, OrderFilled, Side, Signal};
use crate::indicators::{Ema, Indicator, Vwap};

#[derive(Debug)]
struct SymbolState {
    vwap: Vwap,
    ema: Ema,
    holding: Holding,
}

/// `tolerance` and `target` are percentages.
#[derive(Debug)]
pub struct VwapBounce {
    id: String,
    symbols: Vec<String>,
    tolerance: f64,
    target: f64,
    ema_period: usize,
    quantity: f64,
    state: HashMap<String, SymbolState>,
}

impl VwapBounce {
    pub fn new(id: &str, symbols: Vec<String>, tolerance: f64, target: f64, ema_period: usize) -> Self {
        Self {
            id: id.to_string(),
            symbols,
            tolerance: if tolerance > 0.0 { tolerance } else { 0.3 },
            target: if target > 0.0 { target } else { 1.0 },
            ema_period,
            quantity: DEFAULT_QUANTITY,
            state: HashMap::new(),
        }
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = quantity;
        self
    }
}

impl Strategy for VwapBounce {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "VWAP Bounce"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn initialize(&mut self) -> Result<()> {
        for s in &self.symbols {
            self.state.insert(
                s.clone(),
                SymbolState { vwap: Vwap::new(), ema: Ema::new(self.ema_period), holding: Holding::default() },
            );
        }
        Ok(())
    }

    fn on_market_data(&mut self, bar: &Bar) -> Result<Option<Signal>> {
        let Some(st) = self.state.get_mut(&bar.symbol) else {
            return Ok(None);
        };
        // Zero-volume bars still move the trend EMA.
        if bar.volume > 0.0 {
            st.vwap.update_bar(bar)?;
        }
        st.ema.update_bar(bar)?;
        if !st.vwap.is_ready() || !st.ema.is_ready() {
            return Ok(None);
        }

        let price = bar.close;
        let vwap = st.vwap.value();
        let distance = st.vwap.distance_pct(price);

        if !st.holding.long {
            let uptrend = price > vwap && st.ema.value() > vwap;
            if uptrend && distance.abs() <= self.tolerance {
                let conf = 0.75 + (self.tolerance - distance.abs()) / self.tolerance * 0.15;
                st.holding.open(price);
                let reason = format!("Pullback to VWAP {:.2} ({:+.2}%) in uptrend", vwap, distance);
                return Ok(Some(Signal::new(&self.id, bar, Side::Buy, conf, self.quantity, reason)));
            }
            return Ok(None);
        }

        let profit_pct = if st.holding.entry_price > 0.0 {
            (price - st.holding.entry_price) / st.holding.entry_price * 100.0
        } else {
            0.0
        };
        let mut exit: Option<(f64, String)> = None;
        if profit_pct >= self.target {
            exit = Some((0.80, format!("Profit target reached: {:.2}%", profit_pct)));
        }
        if price < vwap {
            exit = Some((0.85, format!("Price fell below VWAP {:.2}", vwap)));
        }
        if distance > self.target * 2.0 {
            exit = Some((0.75, format!("Extended {:.2}% above VWAP", distance)));
        }
        if profit_pct < -0.5 {
            exit = Some((0.90, format!("Stop loss: {:.2}%", profit_pct)));
        }
        let Some((conf, reason)) = exit else {
            return Ok(None);
        };
        st.holding.close();
        Ok(Some(Signal::new(&self.id, bar, Side::Sell, conf, self.quantity, reason)))
    }

    fn on_order_filled(&mut self, fill: &OrderFilled) -> Result<()> {
        if let Some(st) = self.state.get_mut(&fill.symbol) {
            st.holding.apply_fill(fill);
        }
        Ok(())
    }
}
