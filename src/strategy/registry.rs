// =============================================================================
// Strategy Registry — name -> constructor, populated at startup
// =============================================================================
//
// Strategies are selected by name at the edges (CLI, back-test params); the
// registry turns a name plus an untyped JSON parameter bag into a concrete
// strategy, validating the bag into that strategy's closed parameter struct.
// Unknown names and bad parameters are typed errors, not panics.
// =============================================================================

use std::collections::HashMap;

use thiserror::Error;

use super::bollinger::{BollingerParams, BollingerStrategy};
use super::dual_ma::{DualMaParams, DualMaStrategy};
use super::macd::{MacdParams, MacdStrategy};
use super::rsi::{RsiParams, RsiStrategy};
use super::Strategy;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("unknown strategy: {0}")]
    Unknown(String),
    #[error("invalid parameters for {strategy}: {message}")]
    InvalidParams { strategy: String, message: String },
}

type Builder =
    Box<dyn Fn(serde_json::Value) -> Result<Box<dyn Strategy>, StrategyError> + Send + Sync>;

/// Registry of strategy constructors.
pub struct StrategyRegistry {
    builders: HashMap<String, Builder>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// The registry with every bundled strategy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("dual_ma", |params| {
            let params: DualMaParams = parse_params("dual_ma", params)?;
            Ok(Box::new(DualMaStrategy::new(params)?) as Box<dyn Strategy>)
        });
        registry.register("rsi", |params| {
            let params: RsiParams = parse_params("rsi", params)?;
            Ok(Box::new(RsiStrategy::new(params)?) as Box<dyn Strategy>)
        });
        registry.register("macd", |params| {
            let params: MacdParams = parse_params("macd", params)?;
            Ok(Box::new(MacdStrategy::new(params)?) as Box<dyn Strategy>)
        });
        registry.register("bollinger", |params| {
            let params: BollingerParams = parse_params("bollinger", params)?;
            Ok(Box::new(BollingerStrategy::new(params)?) as Box<dyn Strategy>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, builder: F)
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Strategy>, StrategyError> + Send + Sync + 'static,
    {
        self.builders.insert(name.to_string(), Box::new(builder));
    }

    /// Build a strategy by name. `params` may be `Value::Null` for defaults.
    pub fn build(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<Box<dyn Strategy>, StrategyError> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| StrategyError::Unknown(name.to_string()))?;
        builder(params)
    }

    /// Registered strategy names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Validate an untyped parameter bag into a closed struct. Null and missing
/// bags mean defaults.
fn parse_params<T: serde::de::DeserializeOwned + Default>(
    strategy: &str,
    params: serde_json::Value,
) -> Result<T, StrategyError> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|e| StrategyError::InvalidParams {
        strategy: strategy.to_string(),
        message: e.to_string(),
    })
}
