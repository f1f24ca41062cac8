// =============================================================================
// Strategy optimizer — deterministic grid search over parameter space
// =============================================================================
//
// Every combination of the supplied parameter grid is merged into the base
// back-test parameters and replayed; trials are scored by the chosen
// objective and the best combination wins. BTreeMap ordering plus the
// deterministic replay makes the whole search reproducible.
//
// The trial budget is capped; an oversized grid is truncated with a warning
// rather than rejected.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backtest::{BacktestParams, BacktestRunner};
use crate::engine::BacktestResults;
use crate::tasks::progress::ProgressCallback;
use crate::tasks::{TaskError, TaskManager};

/// Upper bound on grid-search trials per optimization.
const MAX_TRIALS: usize = 200;

/// What a trial is scored by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    SharpeRatio,
    TotalReturn,
    WinRate,
    ProfitFactor,
}

impl Default for Objective {
    fn default() -> Self {
        Self::SharpeRatio
    }
}

impl Objective {
    fn score(&self, results: &BacktestResults) -> f64 {
        match self {
            Self::SharpeRatio => results.sharpe_ratio,
            Self::TotalReturn => results.total_return,
            Self::WinRate => results.win_rate,
            Self::ProfitFactor => results.profit_factor,
        }
    }
}

/// An optimization request: a base back-test plus the grid to sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationParams {
    #[serde(flatten)]
    pub base: BacktestParams,
    /// Parameter name -> candidate values. Sorted keys keep runs stable.
    pub grid: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub objective: Objective,
}

/// One scored trial.
#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    pub params: Value,
    pub score: f64,
    pub total_trades: usize,
    pub total_return: f64,
    pub win_rate: f64,
}

/// The optimizer's final report.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationOutcome {
    pub best_params: Value,
    pub best_score: f64,
    pub objective: Objective,
    pub trials: usize,
    pub results: Vec<TrialResult>,
}

pub struct StrategyOptimizer {
    runner: Arc<BacktestRunner>,
}

impl StrategyOptimizer {
    pub fn new(runner: Arc<BacktestRunner>) -> Self {
        Self { runner }
    }

    /// Sweep the grid. `on_progress` is called after each trial with global
    /// progress in [0, 100].
    pub async fn run(
        &self,
        params: &OptimizationParams,
        on_progress: Option<ProgressCallback>,
    ) -> Result<OptimizationOutcome> {
        let mut combos = expand_grid(&params.grid);
        if combos.len() > MAX_TRIALS {
            warn!(
                requested = combos.len(),
                cap = MAX_TRIALS,
                "parameter grid truncated to the trial budget"
            );
            combos.truncate(MAX_TRIALS);
        }
        if combos.is_empty() {
            anyhow::bail!("optimization grid is empty");
        }

        info!(
            strategy = %params.base.strategy,
            trials = combos.len(),
            objective = ?params.objective,
            "grid search starting"
        );

        let mut results = Vec::with_capacity(combos.len());
        let total = combos.len();

        for (index, combo) in combos.into_iter().enumerate() {
            let mut trial_params = params.base.clone();
            trial_params.strategy_params = merge_params(&params.base.strategy_params, &combo);

            match self.runner.run(&trial_params, None).await {
                Ok(outcome) => {
                    let score = params.objective.score(&outcome);
                    results.push(TrialResult {
                        params: combo,
                        score: if score.is_finite() { score } else { f64::MIN },
                        total_trades: outcome.total_trades,
                        total_return: outcome.total_return,
                        win_rate: outcome.win_rate,
                    });
                }
                Err(e) => {
                    // One bad combination must not sink the sweep.
                    warn!(trial = index, error = %e, "trial failed, skipping");
                }
            }

            if let Some(callback) = &on_progress {
                callback(((index + 1) * 100 / total) as u8);
            }
        }

        let best = results
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .ok_or_else(|| anyhow::anyhow!("every trial failed"))?;

        info!(best_score = best.score, "grid search complete");
        Ok(OptimizationOutcome {
            best_params: best.params.clone(),
            best_score: best.score,
            objective: params.objective,
            trials: results.len(),
            results: results.clone(),
        })
    }
}

/// Create an optimization task under the optimization manager.
pub fn submit_optimization(
    manager: &TaskManager,
    runner: Arc<BacktestRunner>,
    params: OptimizationParams,
) -> Result<String, TaskError> {
    let task_id = Uuid::new_v4().to_string();
    let params_value = serde_json::to_value(&params).unwrap_or(Value::Null);

    let progress_manager = manager.clone();
    let progress_id = task_id.clone();
    manager.create_task(&task_id, params_value, async move {
        let callback: ProgressCallback =
            Arc::new(move |p| progress_manager.update_progress(&progress_id, p));
        let optimizer = StrategyOptimizer::new(runner);
        let outcome = optimizer.run(&params, Some(callback)).await?;
        Ok(serde_json::to_value(outcome)?)
    })?;

    Ok(task_id)
}

/// Cartesian product of the grid as JSON objects, in key-sorted order.
fn expand_grid(grid: &BTreeMap<String, Vec<Value>>) -> Vec<Value> {
    let mut combos = vec![serde_json::Map::new()];
    for (key, values) in grid {
        if values.is_empty() {
            continue;
        }
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut widened = combo.clone();
                widened.insert(key.clone(), value.clone());
                next.push(widened);
            }
        }
        combos = next;
    }
    combos
        .into_iter()
        .filter(|c| !c.is_empty())
        .map(Value::Object)
        .collect()
}

/// Overlay `combo` onto the base strategy params.
fn merge_params(base: &Value, combo: &Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Value::Object(overlay) = combo {
        for (k, v) in overlay {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}
