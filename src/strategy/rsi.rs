//! RSI mean reversion: buy oversold, exit on overbought or a return to 50.

use std::collections::HashMap;

use super::{Holding, Strategy, DEFAULT_QUANTITY};
use crate::error::{EngineError, Result};
use crate::events::{Bar, OrderFilled, Side, Signal};
use crate::indicators::{Indicator, Rsi};

#[derive(Debug)]
pub struct RsiMeanReversion {
    id: String,
    symbols: Vec<String>,
    period: usize,
    oversold: f64,
    overbought: f64,
    quantity: f64,
    rsi: HashMap<String, Rsi>,
    holdings: HashMap<String, Holding>,
}

impl RsiMeanReversion {
    pub fn new(id: &str, symbols: Vec<String>, period: usize, oversold: f64, overbought: f64) -> Result<Self> {
        if !(0.0..=100.0).contains(&oversold) || !(0.0..=100.0).contains(&overbought) || oversold >= overbought {
            return Err(EngineError::SimulationConfiguration(format!(
                "RSI thresholds must satisfy 0 <= oversold ({}) < overbought ({}) <= 100",
                oversold, overbought
            )));
        }
        Ok(Self {
            id: id.to_string(),
            symbols,
            period,
            oversold,
            overbought,
            quantity: DEFAULT_QUANTITY,
            rsi: HashMap::new(),
            holdings: HashMap::new(),
        })
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = quantity;
        self
    }

    /// 0.6 at the threshold, rising to 0.95 thirty points beyond it.
    fn confidence(distance: f64) -> f64 {
        (0.6 + (distance / 30.0) * 0.35).clamp(0.6, 0.95)
    }
}

impl Strategy for RsiMeanReversion {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "RSI Mean Reversion"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn initialize(&mut self) -> Result<()> {
        for s in &self.symbols {
            self.rsi.insert(s.clone(), Rsi::new(self.period));
            self.holdings.insert(s.clone(), Holding::default());
        }
        Ok(())
    }

    fn on_market_data(&mut self, bar: &Bar) -> Result<Option<Signal>> {
        let (Some(rsi), Some(holding)) = (self.rsi.get_mut(&bar.symbol), self.holdings.get_mut(&bar.symbol)) else {
            return Ok(None);
        };
        rsi.update_bar(bar)?;
        if !rsi.is_ready() {
            return Ok(None);
        }
        let value = rsi.value();

        if !holding.long {
            if value < self.oversold {
                holding.open(bar.close);
                let reason = format!("RSI oversold: {:.2} < {:.0}", value, self.oversold);
                let conf = Self::confidence(self.oversold - value);
                return Ok(Some(Signal::new(&self.id, bar, Side::Buy, conf, self.quantity, reason)));
            }
            return Ok(None);
        }

        if value > self.overbought {
            holding.close();
            let reason = format!("RSI overbought: {:.2} > {:.0} (take profit)", value, self.overbought);
            let conf = Self::confidence(value - self.overbought);
            return Ok(Some(Signal::new(&self.id, bar, Side::Sell, conf, self.quantity, reason)));
        }
        if value >= 50.0 {
            holding.close();
            let reason = format!("RSI returned to neutral: {:.2}", value);
            return Ok(Some(Signal::new(&self.id, bar, Side::Sell, 0.7, self.quantity, reason)));
        }
        Ok(None)
    }

    fn on_order_filled(&mut self, fill: &OrderFilled) -> Result<()> {
        if let Some(h) = self.holdings.get_mut(&fill.symbol) {
            h.apply_fill(fill);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: i64, c: f64) -> Bar {
        Bar::new("SPY", i * 60, c, c, c, c, 1000.0)
    }

    #[test]
    fn test_buy_when_oversold_then_exit_at_neutral() {
        let mut s = RsiMeanReversion::new("rsi", vec!["SPY".into()], 14, 30.0, 70.0).unwrap();
        s.initialize().unwrap();
        let mut signals = Vec::new();
        let mut price = 100.0;
        for i in 0..20 {
            price -= 1.0;
            if let Some(sig) = s.on_market_data(&bar(i, price)).unwrap() {
                signals.push(sig);
            }
        }
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
        assert!((signals[0].confidence - 0.95).abs() < 1e-9);

        for i in 20..40 {
            price += 2.0;
            if let Some(sig) = s.on_market_data(&bar(i, price)).unwrap() {
                signals.push(sig);
                break;
            }
        }
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[1].side, Side::Sell);
    }

    #[test]
    fn test_no_signal_during_warmup() {
        let mut s = RsiMeanReversion::new("rsi", vec!["SPY".into()], 14, 30.0, 70.0).unwrap();
        s.initialize().unwrap();
        for i in 0..14 {
            assert!(s.on_market_data(&bar(i, 100.0 - i as f64)).unwrap().is_none());
        }
    }

    #[test]
    fn test_invalid_thresholds() {
        assert!(RsiMeanReversion::new("r", vec![], 14, 70.0, 30.0).is_err());
        assert!(RsiMeanReversion::new("r", vec![], 14, -1.0, 30.0).is_err());
    }

    #[test]
    fn test_confidence_bounds() {
        assert_eq!(RsiMeanReversion::confidence(0.0), 0.6);
        assert_eq!(RsiMeanReversion::confidence(100.0), 0.95);
    }
}
