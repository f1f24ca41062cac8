// =============================================================================
// MACD Crossover Strategy
// =============================================================================
//
// Entry:
//   MACD line crosses above the signal line -> OPEN_LONG
//   MACD line crosses below the signal line -> OPEN_SHORT
//
// Exit: a cross against the open position.
// =============================================================================

use serde::Deserialize;

use crate::types::{Bar, IndicatorVector, Side, Signal, SignalAction, SignalType};

use super::registry::StrategyError;
use super::{base_confidence, Position, Strategy};

/// The standard 12/26/9 settings are baked into the indicator vector; the
/// only tunable is how much histogram momentum a cross needs to count.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MacdParams {
    #[serde(default)]
    pub min_histogram: f64,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self { min_histogram: 0.0 }
    }
}

pub struct MacdStrategy {
    params: MacdParams,
}

impl MacdStrategy {
    pub fn new(params: MacdParams) -> Result<Self, StrategyError> {
        if params.min_histogram < 0.0 {
            return Err(StrategyError::InvalidParams {
                strategy: "macd".into(),
                message: "min_histogram must be >= 0".into(),
            });
        }
        Ok(Self { params })
    }

    fn cross(&self, indicator: &IndicatorVector, prev: &IndicatorVector) -> Option<Side> {
        let line = indicator.macd_line?;
        let signal = indicator.macd_signal?;
        let line_prev = prev.macd_line?;
        let signal_prev = prev.macd_signal?;
        let histogram = indicator.macd_histogram?;

        if line_prev <= signal_prev && line > signal && histogram.abs() >= self.params.min_histogram
        {
            Some(Side::Long)
        } else if line_prev >= signal_prev
            && line < signal
            && histogram.abs() >= self.params.min_histogram
        {
            Some(Side::Short)
        } else {
            None
        }
    }
}

impl Strategy for MacdStrategy {
    fn name(&self) -> &str {
        "macd"
    }

    fn check_entry(
        &self,
        symbol: &str,
        bar: &Bar,
        indicator: &IndicatorVector,
        prev: &IndicatorVector,
    ) -> Option<Signal> {
        let side = self.cross(indicator, prev)?;
        let line = indicator.macd_line?;
        let signal_line = indicator.macd_signal?;

        let (signal_type, label) = match side {
            Side::Long => (SignalType::OpenLong, "Bullish MACD cross"),
            Side::Short => (SignalType::OpenShort, "Bearish MACD cross"),
        };

        Some(Signal {
            strategy_name: self.name().to_string(),
            symbol: symbol.to_string(),
            timestamp: bar.timestamp,
            signal_type,
            side,
            action: SignalAction::Open,
            price: bar.close,
            reason: format!("{label}: line {line:.4} vs signal {signal_line:.4}"),
            confidence: base_confidence(indicator),
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
        prev: &IndicatorVector,
    ) -> Option<String> {
        let cross_side = self.cross(indicator, prev)?;
        if cross_side == position.side {
            return None;
        }
        Some(format!(
            "MACD cross against position (histogram {:.4})",
            indicator.macd_histogram.unwrap_or(0.0)
        ))
    }
}
