//! Bollinger band bounce with a squeeze-breakout entry.

use std::collections::HashMap;

use super::{Holding, Strategy, DEFAULT_QUANTITY};
use crate::error::Result;
use crate::events::{Bar, OrderFilled, Side, Signal};
use crate::indicators::{BollingerBands, Indicator};

#[derive(Debug)]
struct SymbolState {
    bands: BollingerBands,
    prev_close: Option<f64>,
    holding: Holding,
}

#[derive(Debug)]
pub struct BollingerBounce {
    id: String,
    symbols: Vec<String>,
    period: usize,
    std_dev: f64,
    quantity: f64,
    state: HashMap<String, SymbolState>,
}

impl BollingerBounce {
    pub fn new(id: &str, symbols: Vec<String>, period: usize, std_dev: f64) -> Self {
        Self {
            id: id.to_string(),
            symbols,
            period,
            std_dev,
            quantity: DEFAULT_QUANTITY,
            state: HashMap::new(),
        }
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = quantity;
        self
    }
}

impl Strategy for BollingerBounce {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Bollinger Bounce"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn initialize(&mut self) -> Result<()> {
        for s in &self.symbols {
            self.state.insert(
                s.clone(),
                SymbolState {
                    bands: BollingerBands::new(self.period, self.std_dev),
                    prev_close: None,
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
        st.bands.update_bar(bar)?;
        let prev = st.prev_close.replace(bar.close);
        if !st.bands.is_ready() {
            return Ok(None);
        }

        let price = bar.close;
        let middle = st.bands.middle();
        let pct_b = st.bands.percent_b(price);
        // Later matches override earlier ones.
        let mut decision: Option<(Side, f64, String)> = None;

        if !st.holding.long {
            if st.bands.is_below_lower(price) || pct_b <= 0.1 {
                let conf = if pct_b < 0.0 { 0.85 } else { 0.75 };
                decision = Some((Side::Buy, conf, format!("Price near lower band: %B {:.2}", pct_b)));
            }
            let squeeze = st.bands.bandwidth() < middle * 0.02;
            if squeeze && price > middle && prev.is_some_and(|p| p <= middle) {
                decision = Some((Side::Buy, 0.70, format!("Squeeze breakout above middle {:.2}", middle)));
            }
        } else {
            if prev.is_some_and(|p| p < middle) && price >= middle {
                decision = Some((Side::Sell, 0.75, format!("Reverted to middle band {:.2}", middle)));
            }
            if price >= st.bands.upper() || pct_b >= 0.9 {
                let conf = if pct_b > 1.0 { 0.85 } else { 0.75 };
                decision = Some((Side::Sell, conf, format!("Price at upper band: %B {:.2}", pct_b)));
            }
            if st.bands.is_below_lower(price) && pct_b < -0.1 {
                decision = Some((Side::Sell, 0.90, format!("Stop: broke below lower band, %B {:.2}", pct_b)));
            }
        }

        let Some((side, conf, reason)) = decision else {
            return Ok(None);
        };
        match side {
            Side::Buy => st.holding.open(price),
            Side::Sell => st.holding.close(),
        }
        Ok(Some(Signal::new(&self.id, bar, side, conf, self.quantity, reason)))
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

    fn feed(s: &mut BollingerBounce, closes: &[f64]) -> Vec<Signal> {
        closes
            .iter()
            .enumerate()
            .filter_map(|(i, c)| s.on_market_data(&Bar::new("SPY", i as i64, *c, *c, *c, *c, 10.0)).unwrap())
            .collect()
    }

    #[test]
    fn test_buy_below_lower_then_sell_at_upper() {
        let mut s = BollingerBounce::new("bb", vec!["SPY".into()], 5, 2.0);
        s.initialize().unwrap();
        let mut closes = vec![100.0, 101.0, 100.0, 101.0, 100.0];
        closes.push(90.0);
        let sigs = feed(&mut s, &closes);
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].side, Side::Buy);

        let sigs = feed(&mut s, &[115.0]);
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].side, Side::Sell);
    }

    #[test]
    fn test_no_signal_inside_bands() {
        let mut s = BollingerBounce::new("bb", vec!["SPY".into()], 5, 2.0);
        s.initialize().unwrap();
        let closes = [100.0, 102.0, 98.0, 101.0, 99.0, 100.0];
        assert!(feed(&mut s, &closes).is_empty());
    }
}
