// =============================================================================
// Back-test runner — history replay behind the task manager
// =============================================================================
//
// Wires the pieces: registry builds the strategy, BacktestDataSource
// preloads history, the engine replays it, and staged progress flows to the
// caller (data_load 0-20, init 20-25, execute 25-95, finalize 95-100).
//
// submit_backtest wraps a run in a task-manager entry so HTTP callers poll
// or subscribe by task id.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::datasource::{BacktestDataSource, DataSource};
use crate::engine::position::{PositionConfig, PositionManager, SizingStrategy};
use crate::engine::{BacktestResults, TradingEngine};
use crate::store::Store;
use crate::strategy::filters::ConfirmationChain;
use crate::strategy::registry::StrategyRegistry;
use crate::strategy::StrategyRuntime;
use crate::tasks::progress::{backtest_stages, ProgressCallback};
use crate::tasks::{TaskError, TaskManager};
use crate::types::MarketType;

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_max_positions() -> usize {
    3
}

fn default_max_exposure_pct() -> f64 {
    0.8
}

fn default_single_position_max_pct() -> f64 {
    0.5
}

fn default_position_pct() -> f64 {
    0.1
}

/// Everything one back-test needs; arrives as JSON from the API edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestParams {
    pub strategy: String,
    #[serde(default)]
    pub strategy_params: Value,
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub start_ts: i64,
    pub end_ts: i64,
    #[serde(default)]
    pub market_type: MarketType,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_max_exposure_pct")]
    pub max_exposure_pct: f64,
    #[serde(default = "default_single_position_max_pct")]
    pub single_position_max_pct: f64,
    /// Fraction of capital per position (fixed-percentage sizing).
    #[serde(default = "default_position_pct")]
    pub position_pct: f64,
}

/// Builds and replays back-tests against one store + registry.
pub struct BacktestRunner {
    store: Arc<dyn Store>,
    registry: Arc<StrategyRegistry>,
}

impl BacktestRunner {
    pub fn new(store: Arc<dyn Store>, registry: Arc<StrategyRegistry>) -> Self {
        Self { store, registry }
    }

    /// Execute one back-test to completion. `on_progress` receives global
    /// progress in [0, 100].
    pub async fn run(
        &self,
        params: &BacktestParams,
        on_progress: Option<ProgressCallback>,
    ) -> Result<BacktestResults> {
        let strategy = self
            .registry
            .build(&params.strategy, params.strategy_params.clone())
            .context("building strategy")?;

        let source = BacktestDataSource::new(
            Arc::clone(&self.store),
            params.start_ts,
            params.end_ts,
            params.market_type,
        );
        let mut stream = source.stream(&params.symbols, &params.timeframe).await?;
        let total_points = stream.remaining().unwrap_or(0).max(1);

        let (staged, execute) = backtest_stages(total_points, on_progress);
        staged.set_stage_progress("data_load", 100);

        let runtime = StrategyRuntime::new(strategy, ConfirmationChain::new());
        let positions = PositionManager::new(PositionConfig {
            initial_balance: params.initial_balance,
            max_positions: params.max_positions,
            max_exposure_pct: params.max_exposure_pct,
            single_position_max_pct: params.single_position_max_pct,
            sizing: SizingStrategy::FixedPercentage {
                pct: params.position_pct,
            },
        });
        let mut engine = TradingEngine::backtest(
            runtime,
            positions,
            params.symbols.clone(),
            params.timeframe.clone(),
        );
        engine.set_progress_tracker(execute);
        staged.set_stage_progress("init", 100);

        engine.run(&mut stream).await?;
        let results = engine.results();
        staged.set_stage_progress("finalize", 100);

        info!(
            strategy = %params.strategy,
            trades = results.total_trades,
            total_return = results.total_return,
            "back-test finished"
        );
        Ok(results)
    }
}

/// Create a back-test task; progress and results surface via the manager.
/// Returns the generated task id.
pub fn submit_backtest(
    manager: &TaskManager,
    runner: Arc<BacktestRunner>,
    params: BacktestParams,
) -> Result<String, TaskError> {
    let task_id = Uuid::new_v4().to_string();
    let params_value = serde_json::to_value(&params).unwrap_or(Value::Null);

    let progress_manager = manager.clone();
    let progress_id = task_id.clone();
    manager.create_task(&task_id, params_value, async move {
        let callback: ProgressCallback =
            Arc::new(move |p| progress_manager.update_progress(&progress_id, p));
        let results = runner.run(&params, Some(callback)).await?;
        Ok(serde_json::to_value(results)?)
    })?;

    Ok(task_id)
}
