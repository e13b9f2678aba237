//! The core handle
//!
//! `Core` wires the settings, store, rate limiters, tab pools, worker
//! pool, exploration-state cache, and collaborators into one explicit,
//! cloneable handle threaded through every caller. There are no process
//! globals: a test harness builds a fresh `Core` per test.
//!
//! The agent-facing actions (`search`, `get_status`, `stop_task`,
//! `enqueue_target`) live here; the transport wrapping them (MCP, HTTP,
//! IPC) is out of scope.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;

use crate::collaborators::Collaborators;
use crate::config::Settings;
use crate::error::CoreResult;
use crate::research::pipeline::{PipelineOptions, SearchPipeline};
use crate::research::state::{ExplorationState, TaskStatus};
use crate::research::state_registry::StateRegistry;
use crate::research::ucb::Priority;
use crate::scheduler::target_worker::TargetWorkerManager;
use crate::search::rate_limiter::AcademicApiRateLimiter;
use crate::search::tab_pool::{EngineRateLimiter, TabPoolRegistry};
use crate::storage::Database;

/// How a task is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Wait for in-flight targets to complete naturally
    Graceful,
    /// Cancel in-flight targets now
    Immediate,
}

/// Default wait for graceful stops
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

struct CoreInner {
    settings: Arc<Settings>,
    db: Database,
    collaborators: Collaborators,
    academic_limiter: AcademicApiRateLimiter,
    engine_limiter: EngineRateLimiter,
    tab_pools: TabPoolRegistry<chromiumoxide::Page>,
    states: StateRegistry,
    workers: TargetWorkerManager,
}

/// The exploration core handle
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    #[must_use]
    pub fn new(settings: Settings, db: Database, collaborators: Collaborators) -> Self {
        let settings = Arc::new(settings);
        let states = StateRegistry::new(
            db.clone(),
            Arc::clone(&settings),
            Arc::clone(&collaborators.evidence_graph),
        );
        Self {
            inner: Arc::new(CoreInner {
                academic_limiter: AcademicApiRateLimiter::new(Arc::clone(&settings)),
                engine_limiter: EngineRateLimiter::new(Arc::clone(&settings)),
                tab_pools: TabPoolRegistry::new(Arc::clone(&settings)),
                states,
                workers: TargetWorkerManager::new(),
                settings,
                db,
                collaborators,
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<Settings> {
        &self.inner.settings
    }

    #[must_use]
    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    #[must_use]
    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    #[must_use]
    pub fn academic_rate_limiter(&self) -> &AcademicApiRateLimiter {
        &self.inner.academic_limiter
    }

    #[must_use]
    pub fn engine_rate_limiter(&self) -> &EngineRateLimiter {
        &self.inner.engine_limiter
    }

    #[must_use]
    pub fn tab_pools(&self) -> &TabPoolRegistry<chromiumoxide::Page> {
        &self.inner.tab_pools
    }

    #[must_use]
    pub fn worker_manager(&self) -> &TargetWorkerManager {
        &self.inner.workers
    }

    /// Exploration state for a task, constructed and loaded on first use
    pub async fn state(&self, task_id: &str) -> CoreResult<Arc<ExplorationState>> {
        self.inner.states.get_or_load(task_id).await
    }

    /// State cache access, for eviction in tests
    #[must_use]
    pub fn state_registry(&self) -> &StateRegistry {
        &self.inner.states
    }

    /// Start the target-queue worker pool
    pub async fn start_workers(&self) {
        self.inner.workers.start(self.clone()).await;
    }

    /// Stop the target-queue worker pool
    pub async fn stop_workers(&self) {
        self.inner.workers.stop().await;
    }

    // =========================================================================
    // Agent-facing actions
    // =========================================================================

    /// Create a task row for a hypothesis. Idempotent.
    pub async fn create_task(&self, task_id: &str, hypothesis: &str) -> CoreResult<()> {
        self.inner.db.create_task(task_id, hypothesis, "").await
    }

    /// `search` action: run one query through the pipeline for a task.
    pub async fn run_search(
        &self,
        task_id: &str,
        query: &str,
        options: &serde_json::Value,
    ) -> CoreResult<serde_json::Value> {
        let state = match self.state(task_id).await {
            Ok(state) => state,
            Err(e) => {
                return Ok(json!({
                    "ok": false,
                    "error_code": "state_unavailable",
                    "errors": [e.to_string()],
                }));
            }
        };

        // Only failed tasks reject new work; paused tasks are resumable.
        if state.task_status() == TaskStatus::Failed {
            return Ok(json!({
                "ok": false,
                "error_code": "task_failed",
                "errors": [format!("Task {task_id} is in failed state and rejects new targets")],
            }));
        }

        let pipeline = SearchPipeline::new(
            task_id,
            Arc::clone(&state),
            self.inner.db.clone(),
            self.inner.collaborators.clone(),
            Arc::clone(&self.inner.settings),
        );
        let options = PipelineOptions::from_json(options);
        let result = pipeline.execute(query, &options).await;
        Ok(result.to_value())
    }

    /// `get_status` action, with optional long polling.
    pub async fn get_status(
        &self,
        task_id: &str,
        wait: Option<Duration>,
    ) -> CoreResult<serde_json::Value> {
        let state = self.state(task_id).await?;
        state.record_activity();
        let report = state.status_wait(wait).await;
        Ok(serde_json::to_value(report)?)
    }

    /// `stop_task` action: cancel or drain in-flight targets, finalize,
    /// and persist the final task status.
    pub async fn stop_task(
        &self,
        task_id: &str,
        mode: StopMode,
        reason: Option<&str>,
    ) -> CoreResult<serde_json::Value> {
        let state = self.state(task_id).await?;
        let reason = reason.unwrap_or("session_completed");

        match mode {
            StopMode::Immediate => {
                let cancelled = self.inner.workers.cancel_jobs_for_task(task_id).await;
                info!(task_id, cancelled, reason, "Stopping task (immediate)");
            }
            StopMode::Graceful => {
                let waited = self
                    .inner
                    .workers
                    .wait_for_task_jobs_to_complete(task_id, GRACEFUL_STOP_TIMEOUT)
                    .await;
                info!(task_id, waited, reason, "Stopping task (graceful)");
            }
        }

        let report = state.finalize(reason).await;
        state.save_state().await?;
        state.notify_status_change();

        Ok(serde_json::to_value(report)?)
    }

    /// `enqueue_target` action: queue a query / URL / DOI target for the
    /// worker pool.
    pub async fn enqueue_target(
        &self,
        task_id: &str,
        target: serde_json::Value,
        priority: Priority,
        options: Option<serde_json::Value>,
    ) -> CoreResult<serde_json::Value> {
        let state = self.state(task_id).await?;
        if state.task_status() == TaskStatus::Failed {
            return Ok(json!({
                "ok": false,
                "error_code": "task_failed",
                "errors": [format!("Task {task_id} is in failed state and rejects new targets")],
            }));
        }

        let input = json!({
            "target": target,
            "options": options.unwrap_or_else(|| json!({})),
        });
        let target_id = self
            .inner
            .db
            .enqueue_job(
                task_id,
                "target_queue",
                priority.queue_rank(),
                Some(&input.to_string()),
            )
            .await?;

        Ok(json!({"ok": true, "target_id": target_id}))
    }
}
