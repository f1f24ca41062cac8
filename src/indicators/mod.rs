// =============================================================================
// Incremental Indicator Calculators
// =============================================================================
//
// Stateful per-series calculators with O(1) per-bar update cost. A fresh
// CalculatorSet is preheated once from history and then fed live bars; no
// database access happens anywhere in this module.
//
// Every calculator exposes `update(..) -> Option<..>` (or a value that is
// meaningful from the first sample) plus `is_ready()` / `reset()`, so "not
// warm yet" is encoded as `None`, never as an error.
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

use tracing::warn;

use crate::types::{Bar, IndicatorVector};

use self::atr::Atr;
use self::bollinger::Bollinger;
use self::ema::Ema;
use self::macd::Macd;
use self::rsi::Rsi;
use self::sma::Sma;

// ---------------------------------------------------------------------------
// Warm-up requirements
// ---------------------------------------------------------------------------

/// Bars each indicator needs before it produces a trustworthy value.
/// EMA-family entries list the conventional settle window rather than the
/// single sample they technically need.
pub const WARMUP_REQUIREMENTS: &[(&str, usize)] = &[
    ("ma5", 5),
    ("ma10", 10),
    ("ma20", 20),
    ("ma60", 60),
    ("ma120", 120),
    ("ema12", 12),
    ("ema26", 26),
    ("rsi14", 15),
    ("macd", 35),
    ("bollinger", 20),
    ("atr14", 15),
    ("volume_ma5", 5),
];

/// Preheat target: enough history to warm every calculator.
pub fn max_required_bars() -> usize {
    WARMUP_REQUIREMENTS.iter().map(|(_, n)| *n).max().unwrap_or(0)
}

/// Minimum history below which a preheat is pointless.
pub fn min_required_bars() -> usize {
    WARMUP_REQUIREMENTS.iter().map(|(_, n)| *n).min().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Calculator set
// ---------------------------------------------------------------------------

/// All per-series calculators for one (symbol, timeframe, market) key.
///
/// ```ignore
/// let mut set = CalculatorSet::new();
/// for bar in historical_bars {
///     set.update(&bar); // preheat
/// }
/// let vector = set.update(&live_bar); // O(1) steady state
/// ```
pub struct CalculatorSet {
    ma5: Sma,
    ma10: Sma,
    ma20: Sma,
    ma60: Sma,
    ma120: Sma,
    ema12: Ema,
    ema26: Ema,
    rsi14: Rsi,
    macd: Macd,
    bbands: Bollinger,
    atr14: Atr,
    volume_ma5: Sma,
    update_count: u64,
}

impl CalculatorSet {
    pub fn new() -> Self {
        Self {
            ma5: Sma::new(5),
            ma10: Sma::new(10),
            ma20: Sma::new(20),
            ma60: Sma::new(60),
            ma120: Sma::new(120),
            ema12: Ema::new(12),
            ema26: Ema::new(26),
            rsi14: Rsi::new(14),
            macd: Macd::new(12, 26, 9),
            bbands: Bollinger::new(20, 2.0),
            atr14: Atr::new(14),
            volume_ma5: Sma::new(5),
            update_count: 0,
        }
    }

    /// Feed one bar and produce the indicator vector at its timestamp.
    /// Fields whose calculators are still warming up come back `None`.
    pub fn update(&mut self, bar: &Bar) -> IndicatorVector {
        self.update_count += 1;

        let close = bar.close;
        let key = format!("{}@{}", bar.symbol, bar.timeframe);

        let ma5 = self.ma5.update(close);
        let ma10 = self.ma10.update(close);
        let ma20 = self.ma20.update(close);
        let ma60 = self.ma60.update(close);
        let ma120 = self.ma120.update(close);

        let ema12 = Some(self.ema12.update(close));
        let ema26 = Some(self.ema26.update(close));

        let rsi14 = self.rsi14.update(close);
        let macd = self.macd.update(close);
        let bb = self.bbands.update(close);
        let atr14 = Some(self.atr14.update(bar.high, bar.low, close));
        let volume_ma5 = self.volume_ma5.update(bar.volume);

        let bb_middle = bb.map(|b| b.middle);

        IndicatorVector {
            symbol: bar.symbol.clone(),
            timeframe: bar.timeframe.clone(),
            timestamp: bar.timestamp,
            market_type: bar.market_type,
            ma5: validate_positive(ma5, "ma5", &key),
            ma10: validate_positive(ma10, "ma10", &key),
            ma20: validate_positive(ma20, "ma20", &key),
            ma60: validate_positive(ma60, "ma60", &key),
            ma120: validate_positive(ma120, "ma120", &key),
            ema12: validate_positive(ema12, "ema12", &key),
            ema26: validate_positive(ema26, "ema26", &key),
            rsi14: validate_rsi(rsi14, &key),
            macd_line: validate_finite(Some(macd.macd_line), "macd_line", &key),
            macd_signal: validate_finite(Some(macd.signal), "macd_signal", &key),
            macd_histogram: validate_finite(Some(macd.histogram), "macd_histogram", &key),
            bb_upper: validate_band(bb.map(|b| b.upper), bb_middle, "bb_upper", &key),
            bb_middle: validate_positive(bb_middle, "bb_middle", &key),
            bb_lower: validate_band(bb.map(|b| b.lower), bb_middle, "bb_lower", &key),
            atr14: validate_atr(atr14, &key),
            volume_ma5: validate_non_negative(volume_ma5, "volume_ma5", &key),
        }
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for CalculatorSet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Emission validation — invalid values are coerced to None with a warning
// ---------------------------------------------------------------------------

fn validate_positive(value: Option<f64>, field: &str, key: &str) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => Some(v),
        Some(v) => {
            warn!(key, field, value = v, "coercing invalid indicator value to null");
            None
        }
        None => None,
    }
}

fn validate_non_negative(value: Option<f64>, field: &str, key: &str) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => Some(v),
        Some(v) => {
            warn!(key, field, value = v, "coercing invalid indicator value to null");
            None
        }
        None => None,
    }
}

fn validate_finite(value: Option<f64>, field: &str, key: &str) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() => Some(v),
        Some(v) => {
            warn!(key, field, value = v, "coercing non-finite indicator value to null");
            None
        }
        None => None,
    }
}

fn validate_rsi(value: Option<f64>, key: &str) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() && (0.0..=100.0).contains(&v) => Some(v),
        Some(v) => {
            warn!(key, field = "rsi14", value = v, "RSI outside [0, 100], coercing to null");
            None
        }
        None => None,
    }
}

fn validate_atr(value: Option<f64>, key: &str) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => Some(v),
        Some(v) => {
            warn!(key, field = "atr14", value = v, "negative ATR, coercing to null");
            None
        }
        None => None,
    }
}

/// Bands must be finite and within a plausible multiple of the middle band.
fn validate_band(value: Option<f64>, middle: Option<f64>, field: &str, key: &str) -> Option<f64> {
    let v = value?;
    let m = middle?;
    if v.is_finite() && v.abs() <= m.abs() * 10.0 {
        Some(v)
    } else {
        warn!(key, field, value = v, "implausible band value, coercing to null");
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    fn bar(ts: i64, close: f64, volume: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            timeframe: "1h".into(),
            timestamp: ts,
            market_type: MarketType::Spot,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
        }
    }

    #[test]
    fn warmup_table_bounds() {
        assert_eq!(max_required_bars(), 120);
        assert_eq!(min_required_bars(), 5);
    }

    #[test]
    fn fields_become_ready_in_order() {
        let mut set = CalculatorSet::new();

        let first = set.update(&bar(0, 100.0, 10.0));
        // EMA / MACD / ATR are live from the first bar; windowed ones are not.
        assert!(first.ema12.is_some());
        assert!(first.macd_line.is_some());
        assert!(first.atr14.is_some());
        assert!(first.ma5.is_none());
        assert!(first.rsi14.is_none());
        assert!(first.bb_middle.is_none());

        let mut last = first;
        for i in 1..5 {
            last = set.update(&bar(i * 3_600, 100.0 + i as f64, 10.0));
        }
        assert!(last.ma5.is_some());
        assert!(last.rsi14.is_some());
        assert!(last.ma20.is_none());

        for i in 5..120 {
            last = set.update(&bar(i * 3_600, 100.0 + i as f64, 10.0));
        }
        assert!(last.ma20.is_some());
        assert!(last.ma60.is_some());
        assert!(last.ma120.is_some());
        assert!(last.bb_middle.is_some());
        assert!(last.volume_ma5.is_some());
    }

    #[test]
    fn vector_carries_bar_key() {
        let mut set = CalculatorSet::new();
        let v = set.update(&bar(7_200, 100.0, 10.0));
        assert_eq!(v.symbol, "BTCUSDT");
        assert_eq!(v.timeframe, "1h");
        assert_eq!(v.timestamp, 7_200);
        assert_eq!(v.market_type, MarketType::Spot);
    }

    #[test]
    fn sma_sequence_matches_reference() {
        // The documented SMA(5) reference run, through the full set.
        let closes = [100.0, 102.0, 101.0, 103.0, 105.0, 104.0, 106.0];
        let expected = [None, None, None, None, Some(102.2), Some(103.0), Some(103.8)];

        let mut set = CalculatorSet::new();
        for (i, (close, want)) in closes.iter().zip(expected.iter()).enumerate() {
            let v = set.update(&bar(i as i64 * 3_600, *close, 10.0));
            match (v.ma5, want) {
                (None, None) => {}
                (Some(g), Some(w)) => assert!((g - w).abs() < 1e-9),
                other => panic!("step {i}: {other:?}"),
            }
        }
    }

    #[test]
    fn preheat_then_incremental_equals_straight_run() {
        // Splitting a series into preheat + live updates must give the same
        // final vector as feeding everything through one loop.
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.21).sin() * 9.0).collect();

        let mut straight = CalculatorSet::new();
        let mut split = CalculatorSet::new();

        let mut last_straight = None;
        for (i, &c) in closes.iter().enumerate() {
            last_straight = Some(straight.update(&bar(i as i64, c, 10.0)));
        }
        for (i, &c) in closes[..150].iter().enumerate() {
            split.update(&bar(i as i64, c, 10.0));
        }
        let mut last_split = None;
        for (i, &c) in closes[150..].iter().enumerate() {
            last_split = Some(split.update(&bar((150 + i) as i64, c, 10.0)));
        }

        let (a, b) = (last_straight.unwrap(), last_split.unwrap());
        assert!((a.ma20.unwrap() - b.ma20.unwrap()).abs() < 1e-9);
        assert!((a.rsi14.unwrap() - b.rsi14.unwrap()).abs() < 1e-9);
        assert!((a.macd_line.unwrap() - b.macd_line.unwrap()).abs() < 1e-9);
        assert!((a.atr14.unwrap() - b.atr14.unwrap()).abs() < 1e-9);
    }

    #[test]
    fn zero_volume_series_keeps_volume_ma() {
        let mut set = CalculatorSet::new();
        let mut v = None;
        for i in 0..10 {
            v = Some(set.update(&bar(i * 3_600, 100.0, 0.0)));
        }
        // Zero is a legal volume average (non-negative rule, not positive).
        assert_eq!(v.unwrap().volume_ma5, Some(0.0));
    }
}
