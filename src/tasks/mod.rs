// =============================================================================
// Task Manager — TTL-bounded background computations with progress fan-out
// =============================================================================
//
// Tasks live in a TTL-bounded map (lazy expiry on read plus a periodic
// sweep) capped at max_tasks entries (oldest evicted first). Execution runs
// under a semaphore so at most max_concurrent task bodies are in flight.
//
// Subscribers implement ProgressSink. Per-task fan-out is serialized
// through a tokio mutex so every subscriber observes status/progress in
// order; a sink that errors is dropped. update_progress only fans out when
// the new value strictly exceeds the recorded one, which both throttles and
// makes delivered progress non-decreasing.
//
// Two engine-wide instances exist: back-test (TTL 1 h, 100 tasks, 3
// concurrent) and optimization (TTL 2 h, 50 tasks, 2 concurrent).
// =============================================================================

pub mod progress;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task already exists: {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Snapshot of one task, also the payload sent to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub params: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// Receives task state snapshots. Errors remove the subscriber.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn send(&self, state: &TaskState) -> Result<()>;
}

/// Aggregate counters for monitoring.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskManagerStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

struct TaskEntry {
    state: TaskState,
    expires_at: Instant,
}

type SubscriberList = Arc<AsyncMutex<Vec<Arc<dyn ProgressSink>>>>;

struct TaskManagerInner {
    name: &'static str,
    ttl: Duration,
    max_tasks: usize,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    insertion_order: Mutex<VecDeque<String>>,
    subscribers: Mutex<HashMap<String, SubscriberList>>,
    semaphore: Arc<Semaphore>,
}

/// TTL-bounded registry of background computations.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<TaskManagerInner>,
}

impl TaskManager {
    pub fn new(name: &'static str, max_tasks: usize, ttl: Duration, max_concurrent: usize) -> Self {
        info!(name, max_tasks, ttl_s = ttl.as_secs(), max_concurrent, "task manager created");
        Self {
            inner: Arc::new(TaskManagerInner {
                name,
                ttl,
                max_tasks,
                tasks: Mutex::new(HashMap::new()),
                insertion_order: Mutex::new(VecDeque::new()),
                subscribers: Mutex::new(HashMap::new()),
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
            }),
        }
    }

    /// The engine-wide back-test instance configuration.
    pub fn backtest() -> Self {
        Self::new("backtest", 100, Duration::from_secs(3_600), 3)
    }

    /// The engine-wide optimization instance configuration.
    pub fn optimization() -> Self {
        Self::new("optimization", 50, Duration::from_secs(7_200), 2)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Register a task and schedule its body under the concurrency
    /// semaphore. The body's Ok value becomes `result`; an Err becomes the
    /// `failed` state's message.
    pub fn create_task<F>(&self, task_id: &str, params: Value, body: F) -> Result<(), TaskError>
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        {
            let mut tasks = self.inner.tasks.lock();
            if let Some(entry) = tasks.get(task_id) {
                if entry.expires_at > Instant::now() {
                    return Err(TaskError::Duplicate(task_id.to_string()));
                }
            }
            tasks.insert(
                task_id.to_string(),
                TaskEntry {
                    state: TaskState {
                        task_id: task_id.to_string(),
                        status: TaskStatus::Pending,
                        progress: 0,
                        params,
                        result: None,
                        error: None,
                        created_at: chrono::Utc::now().timestamp(),
                        started_at: None,
                        completed_at: None,
                    },
                    expires_at: Instant::now() + self.inner.ttl,
                },
            );

            let mut order = self.inner.insertion_order.lock();
            order.push_back(task_id.to_string());
            // Cap the map: oldest entries give way.
            while tasks.len() > self.inner.max_tasks {
                let Some(oldest) = order.pop_front() else { break };
                if oldest != task_id {
                    tasks.remove(&oldest);
                }
            }
        }

        let manager = self.clone();
        let task_id_owned = task_id.to_string();
        tokio::spawn(async move {
            let _permit = manager
                .inner
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");

            manager.mark_running(&task_id_owned);
            manager.notify(&task_id_owned).await;

            let outcome = body.await;

            match outcome {
                Ok(result) => manager.mark_completed(&task_id_owned, result),
                Err(e) => manager.mark_failed(&task_id_owned, &e.to_string()),
            }
            manager.notify(&task_id_owned).await;
        });

        info!(manager = self.inner.name, task_id = %task_id, "task created");
        Ok(())
    }

    fn mark_running(&self, task_id: &str) {
        let mut tasks = self.inner.tasks.lock();
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.state.status = TaskStatus::Running;
            entry.state.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    fn mark_completed(&self, task_id: &str, result: Value) {
        let mut tasks = self.inner.tasks.lock();
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.state.status = TaskStatus::Completed;
            entry.state.result = Some(result);
            entry.state.progress = 100;
            entry.state.completed_at = Some(chrono::Utc::now().timestamp());
        }
        info!(manager = self.inner.name, task_id, "task completed");
    }

    fn mark_failed(&self, task_id: &str, message: &str) {
        let mut tasks = self.inner.tasks.lock();
        if let Some(entry) = tasks.get_mut(task_id) {
            entry.state.status = TaskStatus::Failed;
            entry.state.error = Some(message.to_string());
            entry.state.completed_at = Some(chrono::Utc::now().timestamp());
        }
        warn!(manager = self.inner.name, task_id, error = message, "task failed");
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current state, honoring the TTL (an expired entry reads as absent).
    pub fn get(&self, task_id: &str) -> Option<TaskState> {
        let mut tasks = self.inner.tasks.lock();
        match tasks.get(task_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.state.clone()),
            Some(_) => {
                tasks.remove(task_id);
                self.inner.subscribers.lock().remove(task_id);
                None
            }
            None => None,
        }
    }

    /// All live task states.
    pub fn list(&self) -> Vec<TaskState> {
        let now = Instant::now();
        let tasks = self.inner.tasks.lock();
        tasks
            .values()
            .filter(|e| e.expires_at > now)
            .map(|e| e.state.clone())
            .collect()
    }

    pub fn stats(&self) -> TaskManagerStats {
        let states = self.list();
        let mut stats = TaskManagerStats {
            total: states.len(),
            ..Default::default()
        };
        for state in &states {
            match state.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    // -------------------------------------------------------------------------
    // Progress
    // -------------------------------------------------------------------------

    /// Record progress. Fans out only when `progress` strictly exceeds the
    /// stored value, so subscribers see a non-decreasing sequence.
    pub fn update_progress(&self, task_id: &str, progress: u8) {
        let should_notify = {
            let mut tasks = self.inner.tasks.lock();
            match tasks.get_mut(task_id) {
                Some(entry) if progress.min(100) > entry.state.progress => {
                    entry.state.progress = progress.min(100);
                    true
                }
                _ => false,
            }
        };
        if should_notify {
            let manager = self.clone();
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                manager.notify(&task_id).await;
            });
        }
    }

    /// Attach a sink; it immediately receives the current state and then
    /// every subsequent status/progress change.
    pub async fn register_subscriber(&self, task_id: &str, sink: Arc<dyn ProgressSink>) {
        let list = {
            let mut subscribers = self.inner.subscribers.lock();
            Arc::clone(subscribers.entry(task_id.to_string()).or_default())
        };

        let mut list = list.lock().await;
        if let Some(state) = self.get(task_id) {
            if let Err(e) = sink.send(&state).await {
                warn!(task_id, error = %e, "subscriber rejected initial state");
                return;
            }
        }
        list.push(sink);
        debug!(manager = self.inner.name, task_id, "subscriber registered");
    }

    /// Fan the current state out to every subscriber, serialized per task.
    async fn notify(&self, task_id: &str) {
        let Some(list) = self
            .inner
            .subscribers
            .lock()
            .get(task_id)
            .map(Arc::clone)
        else {
            return;
        };

        let mut list = list.lock().await;
        // Snapshot under the fan-out lock: concurrent notifies then deliver
        // a non-decreasing progress sequence no matter how they interleave.
        let Some(state) = self.get(task_id) else { return };
        let mut kept: Vec<Arc<dyn ProgressSink>> = Vec::with_capacity(list.len());
        for sink in list.drain(..) {
            match sink.send(&state).await {
                Ok(()) => kept.push(sink),
                Err(e) => warn!(task_id, error = %e, "dropping failed subscriber"),
            }
        }
        *list = kept;
    }

    // -------------------------------------------------------------------------
    // Cleanup
    // -------------------------------------------------------------------------

    /// Remove completed/failed tasks older than `age`. Returns the count.
    pub fn cleanup(&self, age: Duration) -> usize {
        let cutoff = chrono::Utc::now().timestamp() - age.as_secs() as i64;
        let mut tasks = self.inner.tasks.lock();
        let before = tasks.len();
        let removed: Vec<String> = tasks
            .iter()
            .filter(|(_, e)| {
                matches!(e.state.status, TaskStatus::Completed | TaskStatus::Failed)
                    && e.state.completed_at.unwrap_or(i64::MAX) <= cutoff
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            tasks.remove(id);
            self.inner.subscribers.lock().remove(id);
        }
        let count = before - tasks.len();
        if count > 0 {
            info!(manager = self.inner.name, removed = count, "cleaned up old tasks");
        }
        count
    }

    /// Periodic sweep of finished tasks; runs until the handle is dropped.
    pub fn spawn_cleanup_loop(&self, every: Duration, age: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                manager.cleanup(age);
            }
        })
    }
}
