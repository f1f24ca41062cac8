// =============================================================================
// Confirmation filters — the gate between entry candidates and positions
// =============================================================================
//
// Chain, in order:
//   1. confidence  >= 0.5
//   2. volume ratio = bar.volume / indicator.volume_ma5 >= 0.5
//   3. volatility   = atr14 / ma20 <= 5%
//   4. optional AI adjudication (external collaborator) with a 5 s timeout;
//      a failed or timed-out call SKIPS the filter, never vetoes
//
// Filters 2 and 3 are skipped when their inputs are still warming up —
// an unknown indicator field is a semantic gap, not a rejection.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Bar, IndicatorVector, Signal};

/// Timeout for the external adjudication call.
const ADJUDICATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Verdict returned by an external signal adjudicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjudication {
    pub execute: bool,
    pub confidence: f64,
    pub reason: String,
}

/// External AI collaborator that reviews entry candidates. Implementations
/// live outside the engine; the chain only depends on this trait.
#[async_trait]
pub trait SignalAdjudicator: Send + Sync {
    async fn adjudicate(
        &self,
        signal: &Signal,
        bar: &Bar,
        indicator: &IndicatorVector,
    ) -> Result<Adjudication>;
}

/// The shared confirmation chain applied to every entry candidate.
pub struct ConfirmationChain {
    min_confidence: f64,
    min_volume_ratio: f64,
    max_volatility_ratio: f64,
    adjudicator: Option<Arc<dyn SignalAdjudicator>>,
}

impl ConfirmationChain {
    pub fn new() -> Self {
        Self {
            min_confidence: 0.5,
            min_volume_ratio: 0.5,
            max_volatility_ratio: 0.05,
            adjudicator: None,
        }
    }

    /// Tighten the volatility ceiling (strategies may narrow, never widen).
    pub fn with_max_volatility(mut self, ratio: f64) -> Self {
        self.max_volatility_ratio = self.max_volatility_ratio.min(ratio);
        self
    }

    pub fn with_adjudicator(mut self, adjudicator: Arc<dyn SignalAdjudicator>) -> Self {
        self.adjudicator = Some(adjudicator);
        self
    }

    /// Run the chain. `None` means confirmed; `Some(reason)` is a veto.
    pub async fn confirm(
        &self,
        signal: &Signal,
        bar: &Bar,
        indicator: &IndicatorVector,
    ) -> Option<String> {
        if signal.confidence < self.min_confidence {
            return Some(format!(
                "confidence {:.2} below {:.2}",
                signal.confidence, self.min_confidence
            ));
        }

        if let Some(volume_ma5) = indicator.volume_ma5 {
            if volume_ma5 > 0.0 {
                let ratio = bar.volume / volume_ma5;
                if ratio < self.min_volume_ratio {
                    return Some(format!(
                        "volume ratio {:.2} below {:.2}",
                        ratio, self.min_volume_ratio
                    ));
                }
            }
        }

        if let (Some(atr), Some(ma20)) = (indicator.atr14, indicator.ma20) {
            if ma20 > 0.0 {
                let ratio = atr / ma20;
                if ratio > self.max_volatility_ratio {
                    return Some(format!(
                        "volatility {:.3} above {:.3}",
                        ratio, self.max_volatility_ratio
                    ));
                }
            }
        }

        if let Some(adjudicator) = &self.adjudicator {
            match tokio::time::timeout(
                ADJUDICATION_TIMEOUT,
                adjudicator.adjudicate(signal, bar, indicator),
            )
            .await
            {
                Ok(Ok(verdict)) => {
                    if !verdict.execute {
                        return Some(format!("adjudicator veto: {}", verdict.reason));
                    }
                    debug!(
                        symbol = %signal.symbol,
                        confidence = verdict.confidence,
                        "adjudicator approved entry"
                    );
                }
                Ok(Err(e)) => {
                    warn!(symbol = %signal.symbol, error = %e, "adjudication failed, skipping filter");
                }
                Err(_) => {
                    warn!(symbol = %signal.symbol, "adjudication timed out, skipping filter");
                }
            }
        }

        None
    }
}

impl Default for ConfirmationChain {
    fn default() -> Self {
        Self::new()
    }
}
