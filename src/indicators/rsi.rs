// =============================================================================
// Relative Strength Index (RSI) — incremental calculator
// =============================================================================
//
// RSI measures the speed and magnitude of recent price changes to evaluate
// whether an asset is overbought or oversold.
//
//   gain_t = max(price_t - price_{t-1}, 0)
//   loss_t = max(price_{t-1} - price_t, 0)
//   RS     = EMA(gain, period) / EMA(loss, period)
//   RSI    = 100 - 100 / (1 + RS)
//
// If the loss average is zero the RSI is clamped to 100. The first sample
// only records the previous price, so the first output appears on the
// second update. Memory: O(1).  Update: O(1).
// =============================================================================

use super::ema::Ema;

/// Incremental RSI smoothed with EMAs over gains and losses.
#[derive(Debug, Clone)]
pub struct Rsi {
    prev_price: Option<f64>,
    avg_gain: Ema,
    avg_loss: Ema,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            prev_price: None,
            avg_gain: Ema::new(period),
            avg_loss: Ema::new(period),
        }
    }

    /// Feed one close. Returns RSI in [0, 100], `None` on the very first call.
    pub fn update(&mut self, price: f64) -> Option<f64> {
        let prev = match self.prev_price {
            None => {
                self.prev_price = Some(price);
                return None;
            }
            Some(p) => p,
        };

        let change = price - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);

        let avg_gain = self.avg_gain.update(gain);
        let avg_loss = self.avg_loss.update(loss);

        self.prev_price = Some(price);

        if avg_loss == 0.0 {
            return Some(100.0);
        }
        let rs = avg_gain / avg_loss;
        Some(100.0 - 100.0 / (1.0 + rs))
    }

    pub fn is_ready(&self) -> bool {
        self.prev_price.is_some()
    }

    pub fn reset(&mut self) {
        self.prev_price = None;
        self.avg_gain.reset();
        self.avg_loss.reset();
    }
}
