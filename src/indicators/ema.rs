// =============================================================================
// Exponential Moving Average (EMA) — incremental calculator
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the SMA.
//
//   alpha = 2 / (period + 1)
//   EMA_t = price_t * alpha + EMA_{t-1} * (1 - alpha)
//
// The first value seeds the EMA directly, so the calculator is ready from
// the first sample. Memory: O(1).  Update: O(1).
// =============================================================================

/// Incremental EMA.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    ema: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            alpha: 2.0 / (period.max(1) as f64 + 1.0),
            ema: None,
        }
    }

    /// Feed one value and return the smoothed result. The first call returns
    /// the input itself.
    pub fn update(&mut self, value: f64) -> f64 {
        let next = match self.ema {
            None => value,
            Some(prev) => value * self.alpha + prev * (1.0 - self.alpha),
        };
        self.ema = Some(next);
        next
    }

    /// Current value without feeding a new sample.
    pub fn value(&self) -> Option<f64> {
        self.ema
    }

    pub fn is_ready(&self) -> bool {
        self.ema.is_some()
    }

    pub fn reset(&mut self) {
        self.ema = None;
    }
}
