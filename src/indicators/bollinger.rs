// =============================================================================
// Bollinger Bands — incremental calculator
// =============================================================================
//
//   middle = SMA(period)
//   upper  = middle + k * sigma
//   lower  = middle - k * sigma
//
// sigma is the population standard deviation over the same window, so the
// window itself must be retained. Memory: O(period).  Update: O(period) for
// the deviation pass over a small fixed window.
// =============================================================================

use std::collections::VecDeque;

use super::sma::Sma;

/// One Bollinger output sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerOutput {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Incremental Bollinger Bands.
#[derive(Debug, Clone)]
pub struct Bollinger {
    period: usize,
    k: f64,
    window: VecDeque<f64>,
    middle: Sma,
}

impl Bollinger {
    pub fn new(period: usize, k: f64) -> Self {
        let period = period.max(1);
        Self {
            period,
            k,
            window: VecDeque::with_capacity(period),
            middle: Sma::new(period),
        }
    }

    /// Feed one close. Returns the bands once the window is full.
    pub fn update(&mut self, price: f64) -> Option<BollingerOutput> {
        if self.window.len() == self.period {
            self.window.pop_front();
        }
        self.window.push_back(price);

        let middle = self.middle.update(price)?;
        if self.window.len() < self.period {
            return None;
        }

        let variance = self
            .window
            .iter()
            .map(|v| {
                let d = v - middle;
                d * d
            })
            .sum::<f64>()
            / self.period as f64;
        let sigma = variance.sqrt();

        Some(BollingerOutput {
            upper: middle + self.k * sigma,
            middle,
            lower: middle - self.k * sigma,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.middle.reset();
    }
}
