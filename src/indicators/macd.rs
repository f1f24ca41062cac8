// =============================================================================
// MACD (Moving Average Convergence Divergence) — incremental calculator
// =============================================================================
//
//   macd_line = EMA(fast) - EMA(slow)
//   signal    = EMA(macd_line, signal_period)
//   histogram = macd_line - signal
//
// Memory: O(1).  Update: O(1).
// =============================================================================

use super::ema::Ema;

/// One MACD output sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd_line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Incremental MACD built from three EMAs.
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Self {
        Self {
            fast: Ema::new(fast_period),
            slow: Ema::new(slow_period),
            signal: Ema::new(signal_period),
        }
    }

    pub fn update(&mut self, price: f64) -> MacdOutput {
        let macd_line = self.fast.update(price) - self.slow.update(price);
        let signal = self.signal.update(macd_line);
        MacdOutput {
            macd_line,
            signal,
            histogram: macd_line - signal,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.fast.is_ready()
    }

    pub fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_zero_line() {
        // Both EMAs seed with the same price, so the first MACD is exactly 0.
        let mut macd = Macd::new(12, 26, 9);
        let out = macd.update(100.0);
        assert_eq!(out.macd_line, 0.0);
        assert_eq!(out.signal, 0.0);
        assert_eq!(out.histogram, 0.0);
    }

    #[test]
    fn uptrend_turns_macd_positive() {
        let mut macd = Macd::new(12, 26, 9);
        let mut out = macd.update(100.0);
        for i in 1..60 {
            out = macd.update(100.0 + i as f64);
        }
        // Fast EMA tracks the rise more closely than the slow EMA.
        assert!(out.macd_line > 0.0);
        assert!(out.histogram.is_finite());
    }

    #[test]
    fn histogram_is_line_minus_signal() {
        let mut macd = Macd::new(5, 10, 3);
        for i in 0..40 {
            let out = macd.update(100.0 + (i as f64 * 0.5).sin() * 4.0);
            assert!((out.histogram - (out.macd_line - out.signal)).abs() < 1e-12);
        }
    }

    #[test]
    fn matches_batch_recursion() {
        let closes: Vec<f64> = (0..150).map(|i| 100.0 + (i as f64 * 0.3).sin() * 8.0).collect();
        let mut macd = Macd::new(12, 26, 9);
        let mut last = macd.update(closes[0]);
        for &c in &closes[1..] {
            last = macd.update(c);
        }

        let (a_f, a_s, a_sig) = (2.0 / 13.0, 2.0 / 27.0, 2.0 / 10.0);
        let (mut fast, mut slow) = (closes[0], closes[0]);
        let mut signal = 0.0; // first macd_line is 0
        for &c in &closes[1..] {
            fast = c * a_f + fast * (1.0 - a_f);
            slow = c * a_s + slow * (1.0 - a_s);
            let line = fast - slow;
            signal = line * a_sig + signal * (1.0 - a_sig);
        }
        assert!((last.macd_line - (fast - slow)).abs() < 1e-6);
        assert!((last.signal - signal).abs() < 1e-6);
    }
}
