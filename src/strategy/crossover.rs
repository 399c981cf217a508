//! Moving-average crossover.

use std::collections::{HashMap, VecDeque};

use super::{Strategy, DEFAULT_QUANTITY};
use crate::error::{EngineError, Result};
use crate::events::{Bar, Side, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cross {
    None,
    Above,
    Below,
}

#[derive(Debug, Default)]
struct SymbolState {
    closes: VecDeque<f64>,
    prev: Option<Cross>,
}

/// BUY when the short MA crosses above the long MA, SELL on the reverse.
///
/// Bars where both averages are equal leave the last side unchanged, so a
/// cross that passes through equality still fires once it resolves.
#[derive(Debug)]
pub struct MaCrossover {
    id: String,
    symbols: Vec<String>,
    short_period: usize,
    long_period: usize,
    quantity: f64,
    state: HashMap<String, SymbolState>,
}

impl MaCrossover {
    pub fn new(id: &str, symbols: Vec<String>, short_period: usize, long_period: usize) -> Result<Self> {
        if short_period == 0 || short_period >= long_period {
            return Err(EngineError::SimulationConfiguration(format!(
                "short period {} must be positive and below long period {}",
                short_period, long_period
            )));
        }
        Ok(Self {
            id: id.to_string(),
            symbols,
            short_period,
            long_period,
            quantity: DEFAULT_QUANTITY,
            state: HashMap::new(),
        })
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = quantity;
        self
    }
}

fn mean(values: impl Iterator<Item = f64>, n: usize) -> f64 {
    values.sum::<f64>() / n as f64
}

impl Strategy for MaCrossover {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "MA Crossover"
    }

    fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn initialize(&mut self) -> Result<()> {
        self.state = self.symbols.iter().map(|s| (s.clone(), SymbolState::default())).collect();
        Ok(())
    }

    fn on_market_data(&mut self, bar: &Bar) -> Result<Option<Signal>> {
        let Some(st) = self.state.get_mut(&bar.symbol) else {
            return Ok(None);
        };
        st.closes.push_back(bar.close);
        while st.closes.len() > self.long_period {
            st.closes.pop_front();
        }
        if st.closes.len() < self.long_period {
            return Ok(None);
        }

        let long_ma = mean(st.closes.iter().copied(), self.long_period);
        let short_ma = mean(st.closes.iter().rev().take(self.short_period).copied(), self.short_period);
        let current = if short_ma > long_ma {
            Cross::Above
        } else if short_ma < long_ma {
            Cross::Below
        } else {
            Cross::None
        };
        if current == Cross::None {
            return Ok(None);
        }

        let prev = st.prev.replace(current);
        let side = match (prev, current) {
            (Some(Cross::Below), Cross::Above) => Side::Buy,
            (Some(Cross::Above), Cross::Below) => Side::Sell,
            _ => return Ok(None),
        };
        let direction = if side == Side::Buy { "above" } else { "below" };
        let reason = format!(
            "MA crossover: short MA {:.2} crossed {} long MA {:.2}",
            short_ma, direction, long_ma
        );
        Ok(Some(Signal::new(&self.id, bar, side, 0.75, self.quantity, reason)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(s: &mut MaCrossover, closes: &[f64]) -> Vec<(usize, Side)> {
        s.initialize().unwrap();
        let mut out = Vec::new();
        for (i, c) in closes.iter().enumerate() {
            let bar = Bar::new("SPY", i as i64 * 60, *c, *c, *c, *c, 1000.0);
            if let Some(sig) = s.on_market_data(&bar).unwrap() {
                out.push((i + 1, sig.side));
            }
        }
        out
    }

    #[test]
    fn test_single_buy_on_upward_cross() {
        let mut closes: Vec<f64> = (1..=21).map(|i| 100.0 - i as f64).collect();
        closes.extend(std::iter::repeat(150.0).take(9));
        let mut s = MaCrossover::new("mac", vec!["SPY".into()], 5, 20).unwrap();
        assert_eq!(run(&mut s, &closes), vec![(22, Side::Buy)]);
    }

    #[test]
    fn test_no_signal_before_long_window() {
        let closes: Vec<f64> = (1..20).map(|i| 100.0 + i as f64).collect();
        let mut s = MaCrossover::new("mac", vec!["SPY".into()], 5, 20).unwrap();
        assert!(run(&mut s, &closes).is_empty());
    }

    #[test]
    fn test_cross_through_equality_fires() {
        // short=1, long=2: MA relation follows the sign of the last change.
        let closes = [10.0, 9.0, 9.0, 10.0, 8.0];
        let mut s = MaCrossover::new("mac", vec!["SPY".into()], 1, 2).unwrap();
        assert_eq!(run(&mut s, &closes), vec![(4, Side::Buy), (5, Side::Sell)]);
    }

    #[test]
    fn test_invalid_periods() {
        assert!(MaCrossover::new("m", vec![], 20, 20).is_err());
        assert!(MaCrossover::new("m", vec![], 0, 20).is_err());
    }
}
