// =============================================================================
// Bollinger Band Touch Strategy
// =============================================================================
//
// Entry:
//   Price bounced off the lower band  -> OPEN_LONG
//   Price pulled back from the upper band -> OPEN_SHORT
//
// The prior price is approximated by the previous MA20 (the vector does not
// carry raw closes), with the touch threshold widening the band edge.
//
// Exit: mean reversion completed — price reaching the middle band.
// =============================================================================

use serde::Deserialize;

use crate::types::{Bar, IndicatorVector, Side, Signal, SignalAction, SignalType};

use super::registry::StrategyError;
use super::{Position, Strategy};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BollingerParams {
    /// How close to a band counts as touching it, as a fraction of the band.
    #[serde(default = "default_touch_threshold")]
    pub touch_threshold: f64,
}

fn default_touch_threshold() -> f64 {
    0.005
}

impl Default for BollingerParams {
    fn default() -> Self {
        Self {
            touch_threshold: default_touch_threshold(),
        }
    }
}

pub struct BollingerStrategy {
    params: BollingerParams,
}

impl BollingerStrategy {
    pub fn new(params: BollingerParams) -> Result<Self, StrategyError> {
        if !(0.0..0.5).contains(&params.touch_threshold) {
            return Err(StrategyError::InvalidParams {
                strategy: "bollinger".into(),
                message: format!("touch_threshold {} outside [0, 0.5)", params.touch_threshold),
            });
        }
        Ok(Self { params })
    }

    /// Mean-reversion confidence: RSI agreement at the extremes, volume
    /// context, and a wide enough channel each add weight.
    fn calculate_confidence(&self, indicator: &IndicatorVector) -> f64 {
        let mut confidence: f64 = 0.5;

        if let Some(rsi) = indicator.rsi14 {
            if rsi < 35.0 || rsi > 65.0 {
                confidence += 0.15;
            } else if (40.0..=60.0).contains(&rsi) {
                confidence += 0.1;
            }
        }
        if indicator.volume_ma5.is_some() {
            confidence += 0.1;
        }
        if let (Some(upper), Some(middle), Some(lower)) =
            (indicator.bb_upper, indicator.bb_middle, indicator.bb_lower)
        {
            if middle > 0.0 && (upper - lower) / middle > 0.05 {
                confidence += 0.1;
            }
        }

        confidence.min(1.0)
    }
}

impl Strategy for BollingerStrategy {
    fn name(&self) -> &str {
        "bollinger"
    }

    fn check_entry(
        &self,
        symbol: &str,
        bar: &Bar,
        indicator: &IndicatorVector,
        prev: &IndicatorVector,
    ) -> Option<Signal> {
        let upper = indicator.bb_upper?;
        let middle = indicator.bb_middle?;
        let lower = indicator.bb_lower?;
        let price_prev = prev.ma20?;
        let price = bar.close;

        let lower_touch = lower * (1.0 + self.params.touch_threshold);
        let upper_touch = upper * (1.0 - self.params.touch_threshold);
        let bb_width = (upper - lower) / middle * 100.0;

        // Bounce: prior price at or under the lower band, now back above it.
        if price_prev <= lower_touch && price > lower {
            let bounce = (price - lower) / lower * 100.0;
            let mut confidence = self.calculate_confidence(indicator);
            if bounce > 1.0 {
                confidence = (confidence + 0.15).min(1.0);
            }
            return Some(Signal {
                strategy_name: self.name().to_string(),
                symbol: symbol.to_string(),
                timestamp: bar.timestamp,
                signal_type: SignalType::OpenLong,
                side: Side::Long,
                action: SignalAction::Open,
                price,
                reason: format!(
                    "Lower band bounce: price {price:.2} off {lower:.2} \
                     (+{bounce:.2}%, BB width {bb_width:.2}%)"
                ),
                confidence,
                stop_loss: None,
                take_profit: None,
                position_size: None,
            });
        }

        // Pullback: prior price at or over the upper band, now back below it.
        if price_prev >= upper_touch && price < upper {
            let pullback = (upper - price) / upper * 100.0;
            let mut confidence = self.calculate_confidence(indicator);
            if pullback > 1.0 {
                confidence = (confidence + 0.15).min(1.0);
            }
            return Some(Signal {
                strategy_name: self.name().to_string(),
                symbol: symbol.to_string(),
                timestamp: bar.timestamp,
                signal_type: SignalType::OpenShort,
                side: Side::Short,
                action: SignalAction::Open,
                price,
                reason: format!(
                    "Upper band pullback: price {price:.2} off {upper:.2} \
                     (-{pullback:.2}%, BB width {bb_width:.2}%)"
                ),
                confidence,
                stop_loss: None,
                take_profit: None,
                position_size: None,
            });
        }

        None
    }

    fn check_exit(
        &self,
        position: &Position,
        bar: &Bar,
        indicator: &IndicatorVector,
        _prev: &IndicatorVector,
    ) -> Option<String> {
        let middle = indicator.bb_middle?;
        match position.side {
            Side::Long if bar.close >= middle => Some("Price reached middle band".to_string()),
            Side::Short if bar.close <= middle => Some("Price reached middle band".to_string()),
            _ => None,
        }
    }
}
