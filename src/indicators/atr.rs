// =============================================================================
// Average True Range (ATR) — incremental calculator
// =============================================================================
//
// ATR measures volatility by decomposing the entire range of a bar.
//
//   TR  = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR = EMA(TR, period)
//
// The very first bar has no previous close, so its TR is simply H - L.
// Memory: O(1).  Update: O(1).
// =============================================================================

use super::ema::Ema;

/// Incremental ATR smoothed with an EMA.
#[derive(Debug, Clone)]
pub struct Atr {
    prev_close: Option<f64>,
    tr_ema: Ema,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            prev_close: None,
            tr_ema: Ema::new(period),
        }
    }

    /// Feed one bar's high/low/close.
    pub fn update(&mut self, high: f64, low: f64, close: f64) -> f64 {
        let tr = match self.prev_close {
            None => high - low,
            Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
        };
        self.prev_close = Some(close);
        self.tr_ema.update(tr)
    }

    pub fn is_ready(&self) -> bool {
        self.prev_close.is_some()
    }

    pub fn reset(&mut self) {
        self.prev_close = None;
        self.tr_ema.reset();
    }
}
