// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. CORS is configured permissively for
// development; tighten the layer before exposing the port.
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::backtest::{submit_backtest, BacktestParams};
use crate::optimizer::{submit_optimization, OptimizationParams};
use crate::tasks::{TaskManagerStats, TaskState};
use crate::types::{Bar, MarketType, Signal};

use super::ApiContext;

/// Build the full REST router with CORS middleware and shared state.
pub fn router(context: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/strategies", get(strategies))
        .route("/api/v1/backtest", post(create_backtest))
        .route("/api/v1/optimize", post(create_optimization))
        .route("/api/v1/tasks", get(list_tasks))
        .route("/api/v1/tasks/:task_id", get(task_status))
        .route("/api/v1/bars/:symbol/:timeframe", get(recent_bars))
        .route("/api/v1/signals/:strategy", get(recent_signals))
        .route("/api/v1/ws/tasks/:task_id", get(super::ws::task_progress_handler))
        .layer(cors)
        .with_state(context)
}

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub server_time: i64,
    pub backtest: TaskManagerStats,
    pub optimization: TaskManagerStats,
}

pub async fn health(State(context): State<ApiContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp(),
        backtest: context.backtest_tasks.stats(),
        optimization: context.optimization_tasks.stats(),
    })
}

// ---------------------------------------------------------------------------
// Strategy catalog
// ---------------------------------------------------------------------------

pub async fn strategies(State(context): State<ApiContext>) -> Json<Vec<String>> {
    Json(context.registry.names())
}

// ---------------------------------------------------------------------------
// Back-test / optimization submission
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TaskCreated {
    pub task_id: String,
}

pub async fn create_backtest(
    State(context): State<ApiContext>,
    Json(params): Json<BacktestParams>,
) -> Result<Json<TaskCreated>, ApiError> {
    // Surface a bad strategy name or parameter bag before a task exists.
    context
        .registry
        .build(&params.strategy, params.strategy_params.clone())
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let task_id = submit_backtest(
        &context.backtest_tasks,
        context.runner.clone(),
        params,
    )
    .map_err(internal)?;

    info!(task_id = %task_id, "back-test task submitted");
    Ok(Json(TaskCreated { task_id }))
}

pub async fn create_optimization(
    State(context): State<ApiContext>,
    Json(params): Json<OptimizationParams>,
) -> Result<Json<TaskCreated>, ApiError> {
    context
        .registry
        .build(&params.base.strategy, params.base.strategy_params.clone())
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let task_id = submit_optimization(
        &context.optimization_tasks,
        context.runner.clone(),
        params,
    )
    .map_err(internal)?;

    info!(task_id = %task_id, "optimization task submitted");
    Ok(Json(TaskCreated { task_id }))
}

// ---------------------------------------------------------------------------
// Task queries
// ---------------------------------------------------------------------------

pub async fn task_status(
    State(context): State<ApiContext>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskState>, ApiError> {
    context
        .find_task(&task_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no such task: {task_id}")))
}

pub async fn list_tasks(State(context): State<ApiContext>) -> Json<Vec<TaskState>> {
    let mut tasks = context.backtest_tasks.list();
    tasks.extend(context.optimization_tasks.list());
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(tasks)
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct BarsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub market_type: MarketType,
}

fn default_limit() -> usize {
    200
}

pub async fn recent_bars(
    State(context): State<ApiContext>,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(query): Query<BarsQuery>,
) -> Result<Json<Vec<Bar>>, ApiError> {
    let bars = context
        .store
        .recent_bars(&symbol, &timeframe, query.limit.min(5_000), None, query.market_type)
        .await
        .map_err(internal)?;
    Ok(Json(bars))
}

#[derive(Deserialize)]
pub struct SignalsQuery {
    pub symbol: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub async fn recent_signals(
    State(context): State<ApiContext>,
    Path(strategy): Path<String>,
    Query(query): Query<SignalsQuery>,
) -> Result<Json<Vec<Signal>>, ApiError> {
    let signals = context
        .store
        .recent_signals(&strategy, query.symbol.as_deref(), query.limit.min(5_000))
        .await
        .map_err(internal)?;
    Ok(Json(signals))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::BacktestRunner;
    use crate::bus::MessageBus;
    use crate::store::MemoryStore;
    use crate::strategy::registry::StrategyRegistry;
    use crate::tasks::TaskManager;
    use std::sync::Arc;

    fn context() -> ApiContext {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(StrategyRegistry::with_builtins());
        ApiContext {
            store: store.clone(),
            registry: registry.clone(),
            runner: Arc::new(BacktestRunner::new(store, registry)),
            backtest_tasks: TaskManager::backtest(),
            optimization_tasks: TaskManager::optimization(),
            bus: MessageBus::new(),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(resp) = health(State(context())).await;
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.backtest.total, 0);
    }

    #[tokio::test]
    async fn strategy_catalog_lists_builtins() {
        let Json(names) = strategies(State(context())).await;
        assert_eq!(names, vec!["bollinger", "dual_ma", "macd", "rsi"]);
    }

    #[tokio::test]
    async fn backtest_submission_validates_strategy() {
        let ctx = context();
        let params = BacktestParams {
            strategy: "momentum_9000".into(),
            strategy_params: serde_json::Value::Null,
            symbols: vec!["BTCUSDT".into()],
            timeframe: "1h".into(),
            start_ts: 0,
            end_ts: 1,
            market_type: MarketType::Spot,
            initial_balance: 10_000.0,
            max_positions: 3,
            max_exposure_pct: 0.8,
            single_position_max_pct: 0.5,
            position_pct: 0.1,
        };
        let err = create_backtest(State(ctx), Json(params)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(err.1.contains("unknown strategy"));
    }

    #[tokio::test]
    async fn backtest_submission_creates_a_task() {
        let ctx = context();
        let params = BacktestParams {
            strategy: "dual_ma".into(),
            strategy_params: serde_json::Value::Null,
            symbols: vec!["BTCUSDT".into()],
            timeframe: "1h".into(),
            start_ts: 0,
            end_ts: 1,
            market_type: MarketType::Spot,
            initial_balance: 10_000.0,
            max_positions: 3,
            max_exposure_pct: 0.8,
            single_position_max_pct: 0.5,
            position_pct: 0.1,
        };
        let Json(created) = create_backtest(State(ctx.clone()), Json(params)).await.unwrap();

        let Json(state) = task_status(State(ctx.clone()), Path(created.task_id.clone()))
            .await
            .unwrap();
        assert_eq!(state.task_id, created.task_id);

        let Json(all) = list_tasks(State(ctx)).await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn missing_task_is_404() {
        let err = task_status(State(context()), Path("nope".into())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bars_endpoint_reads_the_store() {
        let ctx = context();
        ctx.store
            .bulk_upsert_bars(&[Bar {
                symbol: "BTCUSDT".into(),
                timeframe: "1h".into(),
                timestamp: 3_600,
                market_type: MarketType::Spot,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 10.0,
            }])
            .await
            .unwrap();

        let Json(bars) = recent_bars(
            State(ctx),
            Path(("BTCUSDT".into(), "1h".into())),
            Query(BarsQuery {
                limit: 10,
                market_type: MarketType::Spot,
            }),
        )
        .await
        .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 100.5);
    }

    #[test]
    fn router_builds() {
        let _ = router(context());
    }
}
