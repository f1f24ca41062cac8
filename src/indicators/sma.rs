// =============================================================================
// Simple Moving Average (SMA) — incremental sliding-window calculator
// =============================================================================
//
// Keeps a ring of the last `period` inputs and a running sum:
//
//   new_sum = old_sum - oldest + newest
//   SMA     = sum / period
//
// Memory: O(period).  Update: O(1).
// =============================================================================

use std::collections::VecDeque;

/// Incremental SMA over a fixed window.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl Sma {
    /// Create a calculator for the given `period` (must be >= 1).
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::with_capacity(period.max(1)),
            sum: 0.0,
        }
    }

    /// Feed one value. Returns the average once the window is full, `None`
    /// while still warming up.
    pub fn update(&mut self, value: f64) -> Option<f64> {
        if self.window.len() == self.period {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= oldest;
            }
        }
        self.window.push_back(value);
        self.sum += value;

        if self.window.len() < self.period {
            return None;
        }
        Some(self.sum / self.period as f64)
    }

    pub fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_then_values() {
        // The documented reference sequence for SMA(5).
        let closes = [100.0, 102.0, 101.0, 103.0, 105.0, 104.0, 106.0];
        let expected = [None, None, None, None, Some(102.2), Some(103.0), Some(103.8)];

        let mut sma = Sma::new(5);
        for (close, want) in closes.iter().zip(expected.iter()) {
            let got = sma.update(*close);
            match (got, want) {
                (None, None) => {}
                (Some(g), Some(w)) => assert!((g - w).abs() < 1e-9, "got {g}, want {w}"),
                other => panic!("mismatch: {other:?}"),
            }
        }
    }

    #[test]
    fn ready_flag_tracks_window() {
        let mut sma = Sma::new(3);
        assert!(!sma.is_ready());
        sma.update(1.0);
        sma.update(2.0);
        assert!(!sma.is_ready());
        sma.update(3.0);
        assert!(sma.is_ready());
    }

    #[test]
    fn window_slides() {
        let mut sma = Sma::new(2);
        sma.update(1.0);
        assert_eq!(sma.update(3.0), Some(2.0));
        assert_eq!(sma.update(5.0), Some(4.0));
        assert_eq!(sma.update(7.0), Some(6.0));
    }

    #[test]
    fn period_zero_coerced_to_one() {
        let mut sma = Sma::new(0);
        assert_eq!(sma.update(42.0), Some(42.0));
    }

    #[test]
    fn reset_clears_state() {
        let mut sma = Sma::new(2);
        sma.update(1.0);
        sma.update(2.0);
        sma.reset();
        assert!(!sma.is_ready());
        assert_eq!(sma.update(10.0), None);
    }

    #[test]
    fn matches_batch_mean_over_long_series() {
        // Incremental result equals the windowed mean computed from scratch.
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let period = 20;
        let mut sma = Sma::new(period);
        let mut last = None;
        for &c in &closes {
            last = sma.update(c);
        }
        let batch: f64 = closes[closes.len() - period..].iter().sum::<f64>() / period as f64;
        assert!((last.unwrap() - batch).abs() < 1e-6);
    }
}
