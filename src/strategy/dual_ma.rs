// =============================================================================
// Dual Moving Average Crossover Strategy
// =============================================================================
//
// Entry:
//   Golden cross — fast MA crosses above slow MA -> OPEN_LONG
//   Death cross  — fast MA crosses below slow MA -> OPEN_SHORT
//
// Exit: a cross against the open position.
//
// Trend-following; drifts in ranging markets.
// =============================================================================

use serde::Deserialize;

use crate::types::{Bar, IndicatorVector, Side, Signal, SignalAction, SignalType};

use super::registry::StrategyError;
use super::{base_confidence, Position, Strategy};

/// Closed parameter set. Periods must name an MA the indicator vector
/// actually carries.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DualMaParams {
    #[serde(default = "default_fast")]
    pub fast_period: u32,
    #[serde(default = "default_slow")]
    pub slow_period: u32,
}

fn default_fast() -> u32 {
    5
}

fn default_slow() -> u32 {
    20
}

impl Default for DualMaParams {
    fn default() -> Self {
        Self {
            fast_period: default_fast(),
            slow_period: default_slow(),
        }
    }
}

pub struct DualMaStrategy {
    params: DualMaParams,
}

impl DualMaStrategy {
    pub fn new(params: DualMaParams) -> Result<Self, StrategyError> {
        for period in [params.fast_period, params.slow_period] {
            if ma_of(&IndicatorVector::default(), period).is_err() {
                return Err(StrategyError::InvalidParams {
                    strategy: "dual_ma".into(),
                    message: format!("no MA{period} in the indicator vector"),
                });
            }
        }
        if params.fast_period >= params.slow_period {
            return Err(StrategyError::InvalidParams {
                strategy: "dual_ma".into(),
                message: "fast_period must be below slow_period".into(),
            });
        }
        Ok(Self { params })
    }

    fn crosses(
        &self,
        indicator: &IndicatorVector,
        prev: &IndicatorVector,
    ) -> Option<(Side, f64, f64)> {
        let fast = ma_of(indicator, self.params.fast_period).ok()??;
        let slow = ma_of(indicator, self.params.slow_period).ok()??;
        let fast_prev = ma_of(prev, self.params.fast_period).ok()??;
        let slow_prev = ma_of(prev, self.params.slow_period).ok()??;

        if fast_prev <= slow_prev && fast > slow {
            Some((Side::Long, fast, slow))
        } else if fast_prev >= slow_prev && fast < slow {
            Some((Side::Short, fast, slow))
        } else {
            None
        }
    }
}

/// Look up the MA field matching a period.
fn ma_of(indicator: &IndicatorVector, period: u32) -> Result<Option<f64>, ()> {
    match period {
        5 => Ok(indicator.ma5),
        10 => Ok(indicator.ma10),
        20 => Ok(indicator.ma20),
        60 => Ok(indicator.ma60),
        120 => Ok(indicator.ma120),
        _ => Err(()),
    }
}

impl Strategy for DualMaStrategy {
    fn name(&self) -> &str {
        "dual_ma"
    }

    fn check_entry(
        &self,
        symbol: &str,
        bar: &Bar,
        indicator: &IndicatorVector,
        prev: &IndicatorVector,
    ) -> Option<Signal> {
        let (side, fast, slow) = self.crosses(indicator, prev)?;

        let (signal_type, label) = match side {
            Side::Long => (SignalType::OpenLong, "Golden Cross"),
            Side::Short => (SignalType::OpenShort, "Death Cross"),
        };
        let verb = match side {
            Side::Long => "above",
            Side::Short => "below",
        };

        Some(Signal {
            strategy_name: self.name().to_string(),
            symbol: symbol.to_string(),
            timestamp: bar.timestamp,
            signal_type,
            side,
            action: SignalAction::Open,
            price: bar.close,
            reason: format!(
                "{label}: MA{}({fast:.2}) crossed {verb} MA{}({slow:.2})",
                self.params.fast_period, self.params.slow_period
            ),
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
        let (cross_side, fast, slow) = self.crosses(indicator, prev)?;
        // Only a cross against the position closes it.
        if cross_side == position.side {
            return None;
        }
        let label = match cross_side {
            Side::Long => "Golden Cross",
            Side::Short => "Death Cross",
        };
        Some(format!(
            "{label} against position: MA{}({fast:.2}) vs MA{}({slow:.2})",
            self.params.fast_period, self.params.slow_period
        ))
    }
}
