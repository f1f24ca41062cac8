// =============================================================================
// RSI Reversal Strategy
// =============================================================================
//
// Entry:
//   RSI recovers up through the oversold line  -> OPEN_LONG
//   RSI falls down through the overbought line -> OPEN_SHORT
//
// Exit: RSI reaching the opposite extreme.
// =============================================================================

use serde::Deserialize;

use crate::types::{Bar, IndicatorVector, Side, Signal, SignalAction, SignalType};

use super::registry::StrategyError;
use super::{Position, Strategy};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RsiParams {
    #[serde(default = "default_oversold")]
    pub oversold: f64,
    #[serde(default = "default_overbought")]
    pub overbought: f64,
}

fn default_oversold() -> f64 {
    30.0
}

fn default_overbought() -> f64 {
    70.0
}

impl Default for RsiParams {
    fn default() -> Self {
        Self {
            oversold: default_oversold(),
            overbought: default_overbought(),
        }
    }
}

pub struct RsiStrategy {
    params: RsiParams,
}

impl RsiStrategy {
    pub fn new(params: RsiParams) -> Result<Self, StrategyError> {
        let valid = (0.0..100.0).contains(&params.oversold)
            && (0.0..=100.0).contains(&params.overbought)
            && params.oversold < params.overbought;
        if !valid {
            return Err(StrategyError::InvalidParams {
                strategy: "rsi".into(),
                message: format!(
                    "need 0 <= oversold < overbought <= 100, got {} / {}",
                    params.oversold, params.overbought
                ),
            });
        }
        Ok(Self { params })
    }

    /// Reversal-specific confidence: a clear MACD trend, volume context,
    /// and a usable trend baseline each add weight.
    fn calculate_confidence(&self, indicator: &IndicatorVector) -> f64 {
        let mut confidence: f64 = 0.5;

        if matches!(indicator.macd_histogram, Some(h) if h.abs() > 0.01) {
            confidence += 0.15;
        }
        if indicator.volume_ma5.is_some() {
            confidence += 0.1;
        }
        if indicator.ma20.is_some() {
            confidence += 0.1;
        }

        confidence.min(1.0)
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        "rsi"
    }

    fn check_entry(
        &self,
        symbol: &str,
        bar: &Bar,
        indicator: &IndicatorVector,
        prev: &IndicatorVector,
    ) -> Option<Signal> {
        let rsi = indicator.rsi14?;
        let rsi_prev = prev.rsi14?;

        // A prior value sitting exactly on the line still counts as inside
        // the zone; only the current value must have broken out of it.
        let (side, signal_type, momentum, reason) =
            if rsi_prev <= self.params.oversold && rsi > self.params.oversold {
                (
                    Side::Long,
                    SignalType::OpenLong,
                    rsi - rsi_prev,
                    format!(
                        "RSI recovery: {rsi_prev:.1} -> {rsi:.1} crossed up through {}",
                        self.params.oversold
                    ),
                )
            } else if rsi_prev >= self.params.overbought && rsi < self.params.overbought {
                (
                    Side::Short,
                    SignalType::OpenShort,
                    rsi_prev - rsi,
                    format!(
                        "RSI rollover: {rsi_prev:.1} -> {rsi:.1} crossed down through {}",
                        self.params.overbought
                    ),
                )
            } else {
                return None;
            };

        let mut confidence = self.calculate_confidence(indicator);
        // A fast escape from the zone is a stronger reversal.
        if momentum > 5.0 {
            confidence = (confidence + 0.15).min(1.0);
        }

        Some(Signal {
            strategy_name: self.name().to_string(),
            symbol: symbol.to_string(),
            timestamp: bar.timestamp,
            signal_type,
            side,
            action: SignalAction::Open,
            price: bar.close,
            reason,
            confidence,
            stop_loss: None,
            take_profit: None,
            position_size: None,
        })
    }

    fn check_exit(
        &self,
        position: &Position,
        _bar: &Bar,
        indicator: &IndicatorVector,
        _prev: &IndicatorVector,
    ) -> Option<String> {
        let rsi = indicator.rsi14?;
        match position.side {
            Side::Long if rsi >= self.params.overbought => Some(format!(
                "RSI {rsi:.1} reached overbought {}",
                self.params.overbought
            )),
            Side::Short if rsi <= self.params.oversold => Some(format!(
                "RSI {rsi:.1} reached oversold {}",
                self.params.oversold
            )),
            _ => None,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    fn bar() -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            timeframe: "1h".into(),
            timestamp: 7_200,
            market_type: MarketType::Spot,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume: 100.0,
        }
    }

    fn indicator(rsi: f64) -> IndicatorVector {
        IndicatorVector {
            symbol: "BTCUSDT".into(),
            timeframe: "1h".into(),
            timestamp: 7_200,
            rsi14: Some(rsi),
            volume_ma5: Some(100.0),
            ..Default::default()
        }
    }

    fn long_position() -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: 1.0,
            entry_price: 100.0,
            entry_ts: 0,
            high_water: 100.0,
            low_water: 100.0,
            stop_loss: 90.0,
            take_profit: 110.0,
        }
    }

    #[test]
    fn oversold_recovery_opens_long() {
        let strategy = RsiStrategy::new(RsiParams::default()).unwrap();
        let signal = strategy
            .check_entry("BTCUSDT", &bar(), &indicator(33.0), &indicator(25.0))
            .unwrap();
        assert_eq!(signal.signal_type, SignalType::OpenLong);
        assert!(signal.reason.contains("crossed up"));
    }

    #[test]
    fn overbought_rollover_opens_short() {
        let strategy = RsiStrategy::new(RsiParams::default()).unwrap();
        let signal = strategy
            .check_entry("BTCUSDT", &bar(), &indicator(66.0), &indicator(78.0))
            .unwrap();
        assert_eq!(signal.signal_type, SignalType::OpenShort);
    }

    #[test]
    fn deep_oversold_without_recovery_is_quiet() {
        let strategy = RsiStrategy::new(RsiParams::default()).unwrap();
        // Still below the line: no entry until it crosses back up.
        assert!(strategy
            .check_entry("BTCUSDT", &bar(), &indicator(28.0), &indicator(25.0))
            .is_none());
    }

    #[test]
    fn crossing_boundaries_are_inclusive_on_the_prior_bar() {
        let strategy = RsiStrategy::new(RsiParams::default()).unwrap();
        // Prior value exactly on the oversold line still counts as inside.
        assert!(strategy
            .check_entry("BTCUSDT", &bar(), &indicator(31.0), &indicator(30.0))
            .is_some());
        // Current value exactly on the line has not broken out yet.
        assert!(strategy
            .check_entry("BTCUSDT", &bar(), &indicator(30.0), &indicator(25.0))
            .is_none());
        // Mirror for the overbought side.
        assert!(strategy
            .check_entry("BTCUSDT", &bar(), &indicator(69.0), &indicator(70.0))
            .is_some());
        assert!(strategy
            .check_entry("BTCUSDT", &bar(), &indicator(70.0), &indicator(75.0))
            .is_none());
    }

    #[test]
    fn fast_recovery_boosts_confidence() {
        let strategy = RsiStrategy::new(RsiParams::default()).unwrap();
        // Fixture carries only volume_ma5: base 0.5 + 0.1.
        let slow = strategy
            .check_entry("BTCUSDT", &bar(), &indicator(31.0), &indicator(28.0))
            .unwrap();
        assert!((slow.confidence - 0.6).abs() < 1e-9);

        // Momentum of 8 points adds the reversal bonus.
        let fast = strategy
            .check_entry("BTCUSDT", &bar(), &indicator(33.0), &indicator(25.0))
            .unwrap();
        assert!((fast.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn long_exits_at_overbought() {
        let strategy = RsiStrategy::new(RsiParams::default()).unwrap();
        let reason = strategy
            .check_exit(&long_position(), &bar(), &indicator(72.0), &indicator(65.0))
            .unwrap();
        assert!(reason.contains("overbought"));

        assert!(strategy
            .check_exit(&long_position(), &bar(), &indicator(55.0), &indicator(50.0))
            .is_none());
    }

    #[test]
    fn warmup_rsi_is_quiet() {
        let strategy = RsiStrategy::new(RsiParams::default()).unwrap();
        let mut cold = indicator(50.0);
        cold.rsi14 = None;
        assert!(strategy
            .check_entry("BTCUSDT", &bar(), &cold, &indicator(25.0))
            .is_none());
    }

    #[test]
    fn inverted_thresholds_rejected() {
        assert!(RsiStrategy::new(RsiParams {
            oversold: 70.0,
            overbought: 30.0
        })
        .is_err());
    }
}
