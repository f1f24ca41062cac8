// =============================================================================
// Shared types used across the Meridian data plane
// =============================================================================

use serde::{Deserialize, Serialize};

/// Venue segment a bar was sampled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Future,
    Delivery,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Spot
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Future => write!(f, "future"),
            Self::Delivery => write!(f, "delivery"),
        }
    }
}

impl std::str::FromStr for MarketType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "future" => Ok(Self::Future),
            "delivery" => Ok(Self::Delivery),
            other => anyhow::bail!("unknown market type: {other}"),
        }
    }
}

/// Seconds covered by one bar of the given timeframe.
///
/// Unknown timeframes fall back to 1h, matching the fetch paths that treat
/// an unparseable interval as a one-hour grid.
pub fn timeframe_secs(timeframe: &str) -> i64 {
    match timeframe {
        "1m" => 60,
        "3m" => 180,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1_800,
        "1h" => 3_600,
        "4h" => 14_400,
        "1d" => 86_400,
        _ => 3_600,
    }
}

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// A single OHLCV bar.
///
/// Keyed by (symbol, timeframe, timestamp, market_type). The bar covering
/// the current interval is mutable until the interval closes; the store
/// absorbs re-publishes of it via UPSERT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: String,
    /// Bar open time, Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub market_type: MarketType,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Sanity-check the OHLCV invariants (low <= open,close <= high; volume >= 0).
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= 0.0
            && [self.open, self.high, self.low, self.close, self.volume]
                .iter()
                .all(|v| v.is_finite())
    }
}

/// Identifies one bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: String,
    pub market_type: MarketType,
}

impl SeriesKey {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        market_type: MarketType,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            market_type,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.symbol, self.timeframe, self.market_type)
    }
}

// ---------------------------------------------------------------------------
// Indicator vector
// ---------------------------------------------------------------------------

/// Snapshot of all derived statistics at one bar's timestamp.
///
/// Every field is `Option` — `None` means the underlying calculator has not
/// finished warming up (or the computed value failed validation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorVector {
    pub symbol: String,
    pub timeframe: String,
    pub timestamp: i64,
    #[serde(default)]
    pub market_type: MarketType,
    pub ma5: Option<f64>,
    pub ma10: Option<f64>,
    pub ma20: Option<f64>,
    pub ma60: Option<f64>,
    pub ma120: Option<f64>,
    pub ema12: Option<f64>,
    pub ema26: Option<f64>,
    pub rsi14: Option<f64>,
    pub macd_line: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub atr14: Option<f64>,
    pub volume_ma5: Option<f64>,
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Direction of the exposure a signal refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Whether a signal opens or closes a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSE")]
    Close,
}

/// The four concrete signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    #[serde(rename = "OPEN_LONG")]
    OpenLong,
    #[serde(rename = "OPEN_SHORT")]
    OpenShort,
    #[serde(rename = "CLOSE_LONG")]
    CloseLong,
    #[serde(rename = "CLOSE_SHORT")]
    CloseShort,
}

impl SignalType {
    pub fn from_parts(side: Side, action: SignalAction) -> Self {
        match (action, side) {
            (SignalAction::Open, Side::Long) => Self::OpenLong,
            (SignalAction::Open, Side::Short) => Self::OpenShort,
            (SignalAction::Close, Side::Long) => Self::CloseLong,
            (SignalAction::Close, Side::Short) => Self::CloseShort,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenLong => write!(f, "OPEN_LONG"),
            Self::OpenShort => write!(f, "OPEN_SHORT"),
            Self::CloseLong => write!(f, "CLOSE_LONG"),
            Self::CloseShort => write!(f, "CLOSE_SHORT"),
        }
    }
}

/// A strategy's declared intent to open or close a directional position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_name: String,
    pub symbol: String,
    pub timestamp: i64,
    pub signal_type: SignalType,
    pub side: Side,
    pub action: SignalAction,
    pub price: f64,
    pub reason: String,
    /// Confidence score in [0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub position_size: Option<f64>,
}

// ---------------------------------------------------------------------------
// Bus subject helpers
// ---------------------------------------------------------------------------

/// Subject naming convention:
///   bar.<SYMBOL>.<TIMEFRAME>.<MARKET>   — Bar JSON
///   ind.<SYMBOL>.<TIMEFRAME>            — IndicatorVector JSON
///   sig.<STRATEGY>.<SYMBOL>             — Signal JSON
pub mod subjects {
    use super::MarketType;

    pub fn bar(symbol: &str, timeframe: &str, market: MarketType) -> String {
        format!("bar.{symbol}.{timeframe}.{market}")
    }

    pub fn indicator(symbol: &str, timeframe: &str) -> String {
        format!("ind.{symbol}.{timeframe}")
    }

    pub fn signal(strategy: &str, symbol: &str) -> String {
        format!("sig.{strategy}.{symbol}")
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_type_roundtrip() {
        for (s, mt) in [
            ("spot", MarketType::Spot),
            ("future", MarketType::Future),
            ("delivery", MarketType::Delivery),
        ] {
            assert_eq!(s.parse::<MarketType>().unwrap(), mt);
            assert_eq!(mt.to_string(), s);
        }
        assert!("margin".parse::<MarketType>().is_err());
    }

    #[test]
    fn timeframe_seconds_known_and_fallback() {
        assert_eq!(timeframe_secs("1m"), 60);
        assert_eq!(timeframe_secs("1h"), 3_600);
        assert_eq!(timeframe_secs("1d"), 86_400);
        // Unknown timeframe falls back to the hourly grid.
        assert_eq!(timeframe_secs("7w"), 3_600);
    }

    #[test]
    fn bar_validity() {
        let bar = Bar {
            symbol: "BTCUSDT".into(),
            timeframe: "1h".into(),
            timestamp: 1_700_000_000,
            market_type: MarketType::Spot,
            open: 100.0,
            high: 105.0,
            low: 95.0,
            close: 102.0,
            volume: 10.0,
        };
        assert!(bar.is_valid());

        let mut bad = bar.clone();
        bad.low = 103.0; // low above open
        assert!(!bad.is_valid());

        let mut bad = bar.clone();
        bad.volume = -1.0;
        assert!(!bad.is_valid());

        let mut bad = bar;
        bad.close = f64::NAN;
        assert!(!bad.is_valid());
    }

    #[test]
    fn signal_type_serde_wire_names() {
        let json = serde_json::to_string(&SignalType::OpenLong).unwrap();
        assert_eq!(json, r#""OPEN_LONG""#);
        let back: SignalType = serde_json::from_str(r#""CLOSE_SHORT""#).unwrap();
        assert_eq!(back, SignalType::CloseShort);
    }

    #[test]
    fn subject_builders() {
        assert_eq!(
            subjects::bar("BTCUSDT", "1h", MarketType::Future),
            "bar.BTCUSDT.1h.future"
        );
        assert_eq!(subjects::indicator("ETHUSDT", "4h"), "ind.ETHUSDT.4h");
        assert_eq!(subjects::signal("dual_ma", "BTCUSDT"), "sig.dual_ma.BTCUSDT");
    }
}
