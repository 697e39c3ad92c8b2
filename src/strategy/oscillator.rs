//! Price Oscillator
//!
//! RSI-style momentum over a bounded ring of recent mid-prices. Gains and
//! losses are averaged over the same delta count, so the gain/loss ratio
//! reduces to gain-sum over loss-sum.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct PriceOscillator {
    prices: VecDeque<f64>,
    window: usize,
}

impl PriceOscillator {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            prices: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn push(&mut self, price: f64) {
        if self.prices.len() == self.window {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    pub fn is_full(&self) -> bool {
        self.prices.len() == self.window
    }

    /// Oscillator value in [0, 100]. Neutral 0 until the ring is full;
    /// 100 when the window has no losses.
    pub fn value(&self) -> f64 {
        if !self.is_full() {
            return 0.0;
        }

        let mut gain_sum = 0.0;
        let mut loss_sum = 0.0;
        for pair in 0..self.prices.len() - 1 {
            let delta = self.prices[pair + 1] - self.prices[pair];
            if delta > 0.0 {
                gain_sum += delta;
            } else {
                loss_sum += -delta;
            }
        }

        if loss_sum == 0.0 {
            return 100.0;
        }
        let rs = gain_sum / loss_sum;
        100.0 - 100.0 / (1.0 + rs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(prices: &[f64]) -> PriceOscillator {
        let mut oscillator = PriceOscillator::new(prices.len());
        for price in prices {
            oscillator.push(*price);
        }
        oscillator
    }

    #[test]
    fn test_partial_ring_is_neutral() {
        let mut oscillator = PriceOscillator::new(5);
        oscillator.push(10.0);
        oscillator.push(11.0);
        assert!(!oscillator.is_full());
        assert_eq!(oscillator.value(), 0.0);
    }

    #[test]
    fn test_no_losses_is_100() {
        let oscillator = filled(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(oscillator.value(), 100.0);
    }

    #[test]
    fn test_no_gains_is_0() {
        let oscillator = filled(&[5.0, 4.0, 3.0, 2.0, 1.0]);
        assert_eq!(oscillator.value(), 0.0);
    }

    #[test]
    fn test_gains_twice_losses() {
        // Deltas +2, -1, +2, -1: gain sum 4 vs loss sum 2.
        let oscillator = filled(&[10.0, 12.0, 11.0, 13.0, 12.0]);
        assert!((oscillator.value() - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_ring_slides() {
        let mut oscillator = PriceOscillator::new(3);
        for price in [1.0, 2.0, 3.0, 2.0, 1.0] {
            oscillator.push(price);
        }
        // Window is [3, 2, 1]: all losses.
        assert_eq!(oscillator.value(), 0.0);
    }

    #[test]
    fn test_flat_window() {
        let oscillator = filled(&[2.0, 2.0, 2.0, 2.0]);
        // No movement at all counts as no losses.
        assert_eq!(oscillator.value(), 100.0);
    }
}
