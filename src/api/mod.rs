// =============================================================================
// HTTP surface — REST endpoints + WebSocket task progress
// =============================================================================

pub mod rest;
pub mod ws;

use std::sync::Arc;

use crate::backtest::BacktestRunner;
use crate::bus::MessageBus;
use crate::store::Store;
use crate::strategy::registry::StrategyRegistry;
use crate::tasks::TaskManager;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn Store>,
    pub registry: Arc<StrategyRegistry>,
    pub runner: Arc<BacktestRunner>,
    pub backtest_tasks: TaskManager,
    pub optimization_tasks: TaskManager,
    pub bus: MessageBus,
}

impl ApiContext {
    /// Look a task up in whichever manager owns it.
    pub fn find_task(&self, task_id: &str) -> Option<crate::tasks::TaskState> {
        self.backtest_tasks
            .get(task_id)
            .or_else(|| self.optimization_tasks.get(task_id))
    }
}
