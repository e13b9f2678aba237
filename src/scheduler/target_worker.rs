//! Target queue workers
//!
//! Background workers that drain the target queue (`kind='target_queue'`)
//! in `priority ASC, queued_at ASC` order. There is no per-task
//! serialization: one task can have several targets in flight at once.
//!
//! Claim protocol: a conditional UPDATE (`WHERE state='queued'`) is the
//! only synchronization between workers; losing the race just means
//! moving on to the next job. Completion is conditional too
//! (`WHERE state='running'`) so a concurrent cancellation is never
//! overwritten.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::core::Core;
use crate::error::CoreResult;

/// Sleep between queue polls when the queue is empty
pub const EMPTY_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Sleep after a worker-loop error before retrying
pub const ERROR_RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// How long immediate cancellation waits for in-flight jobs to unwind
const CANCEL_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for job teardown
const JOB_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct ManagerInner {
    started: bool,
    workers: Vec<JoinHandle<()>>,
    /// target_id -> (task_id, abort handle of the in-flight target)
    running_jobs: HashMap<String, (String, AbortHandle)>,
}

/// Lifecycle manager for the worker pool, and the cancellation registry
/// behind `stop_task`.
pub struct TargetWorkerManager {
    inner: parking_lot::Mutex<ManagerInner>,
    /// Fired when a worker finds the queue empty, for batch-notification
    /// consumers.
    empty_tx: tokio::sync::broadcast::Sender<()>,
}

impl Default for TargetWorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetWorkerManager {
    #[must_use]
    pub fn new() -> Self {
        let (empty_tx, _) = tokio::sync::broadcast::channel(8);
        Self {
            inner: parking_lot::Mutex::new(ManagerInner {
                started: false,
                workers: Vec::new(),
                running_jobs: HashMap::new(),
            }),
            empty_tx,
        }
    }

    /// Subscribe to queue-empty notifications
    #[must_use]
    pub fn subscribe_empty(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.empty_tx.subscribe()
    }

    fn register_job(&self, target_id: &str, task_id: &str, abort: AbortHandle) {
        let mut inner = self.inner.lock();
        inner
            .running_jobs
            .insert(target_id.to_string(), (task_id.to_string(), abort));
        debug!(target_id, task_id, total_running = inner.running_jobs.len(), "Registered running job");
    }

    fn unregister_job(&self, target_id: &str) {
        let mut inner = self.inner.lock();
        if inner.running_jobs.remove(target_id).is_some() {
            debug!(target_id, total_running = inner.running_jobs.len(), "Unregistered job");
        }
    }

    fn jobs_for_task(&self, task_id: &str) -> Vec<(String, AbortHandle)> {
        self.inner
            .lock()
            .running_jobs
            .iter()
            .filter(|(_, (job_task_id, _))| job_task_id == task_id)
            .map(|(target_id, (_, abort))| (target_id.clone(), abort.clone()))
            .collect()
    }

    fn running_count_for_task(&self, task_id: &str) -> usize {
        self.inner
            .lock()
            .running_jobs
            .values()
            .filter(|(job_task_id, _)| job_task_id == task_id)
            .count()
    }

    /// Count of currently running jobs across all tasks
    #[must_use]
    pub fn running_job_count(&self) -> usize {
        self.inner.lock().running_jobs.len()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock().started
    }

    /// Cancel every in-flight target of a task (stop_task mode=immediate).
    ///
    /// Issues a cancel on each registered handle, yields so the
    /// cancellations land, then waits up to five seconds for the workers
    /// to finish their teardown. Returns how many jobs were cancelled.
    pub async fn cancel_jobs_for_task(&self, task_id: &str) -> usize {
        let jobs = self.jobs_for_task(task_id);
        if jobs.is_empty() {
            return 0;
        }

        // Let in-flight tasks reach an await point before cancelling.
        tokio::task::yield_now().await;

        let mut cancelled = 0usize;
        for (target_id, abort) in &jobs {
            abort.abort();
            cancelled += 1;
            info!(target_id = %target_id, task_id, "Cancelled running target job");
        }

        let deadline = Instant::now() + CANCEL_PROPAGATION_TIMEOUT;
        while self.running_count_for_task(task_id) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    task_id,
                    pending_count = self.running_count_for_task(task_id),
                    "Timeout waiting for job cancellations"
                );
                break;
            }
            tokio::time::sleep(JOB_WAIT_POLL_INTERVAL).await;
        }

        cancelled
    }

    /// Wait for a task's in-flight targets to complete naturally
    /// (stop_task mode=graceful). Never cancels; a timeout is logged and
    /// finalization proceeds regardless. Returns how many jobs were
    /// waited on.
    pub async fn wait_for_task_jobs_to_complete(&self, task_id: &str, timeout: Duration) -> usize {
        let waiting_on = self.running_count_for_task(task_id);
        if waiting_on == 0 {
            return 0;
        }

        info!(task_id, job_count = waiting_on, timeout_secs = timeout.as_secs(), "Waiting for running jobs to complete");

        let deadline = Instant::now() + timeout;
        while self.running_count_for_task(task_id) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    task_id,
                    pending_count = self.running_count_for_task(task_id),
                    "Timeout waiting for jobs to complete (will proceed with finalization)"
                );
                return waiting_on;
            }
            tokio::time::sleep(JOB_WAIT_POLL_INTERVAL).await;
        }

        info!(task_id, job_count = waiting_on, "All running jobs completed");
        waiting_on
    }

    /// Spawn the configured number of workers. Idempotent.
    pub async fn start(&self, core: Core) {
        {
            let inner = self.inner.lock();
            if inner.started {
                return;
            }
        }

        let num_workers = core.settings().concurrency.search_queue.num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let core = core.clone();
            workers.push(tokio::spawn(async move {
                target_queue_worker(core, worker_id).await;
            }));
        }

        let mut inner = self.inner.lock();
        inner.started = true;
        inner.workers = workers;
        inner.running_jobs.clear();
        info!(num_workers, "Target queue workers started");
    }

    /// Cancel all workers and wait for them to exit.
    pub async fn stop(&self) {
        let workers = {
            let mut inner = self.inner.lock();
            if !inner.started {
                return;
            }
            inner.started = false;
            inner.running_jobs.clear();
            std::mem::take(&mut inner.workers)
        };

        for worker in &workers {
            worker.abort();
        }
        let _ = futures::future::join_all(workers).await;
        info!("Target queue workers stopped");
    }
}

/// Payload of one parsed target job
struct TargetInput {
    kind: String,
    target: serde_json::Value,
    options: serde_json::Map<String, serde_json::Value>,
}

fn parse_target_input(input_json: Option<&str>) -> TargetInput {
    let value: serde_json::Value = input_json
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    let target = value.get("target").cloned().unwrap_or_else(|| serde_json::json!({}));
    let kind = target
        .get("kind")
        .and_then(|k| k.as_str())
        .unwrap_or("query")
        .to_string();
    let options = value
        .get("options")
        .and_then(|o| o.as_object())
        .cloned()
        .unwrap_or_default();
    TargetInput {
        kind,
        target,
        options,
    }
}

/// Merge task-level and target-level options (target wins) and annotate
/// with execution identity so downstream can enforce context isolation.
fn merged_options(
    input: &TargetInput,
    task_id: &str,
    target_id: &str,
    worker_id: usize,
) -> serde_json::Map<String, serde_json::Value> {
    let mut options = input.options.clone();
    if let Some(target_options) = input.target.get("options").and_then(|o| o.as_object()) {
        for (key, value) in target_options {
            options.insert(key.clone(), value.clone());
        }
    }
    options.insert("task_id".to_string(), serde_json::json!(task_id));
    options.insert("target_job_id".to_string(), serde_json::json!(target_id));
    options.insert("worker_id".to_string(), serde_json::json!(worker_id));
    options
}

/// Worker coroutine: dequeue, claim, execute, transition. The loop only
/// exits on shutdown; per-job failures are absorbed.
async fn target_queue_worker(core: Core, worker_id: usize) {
    info!(worker_id, "Target queue worker started");

    loop {
        match worker_iteration(&core, worker_id).await {
            Ok(()) => {}
            Err(e) => {
                error!(worker_id, error = %e, "Target queue worker error");
                tokio::time::sleep(ERROR_RECOVERY_DELAY).await;
            }
        }
    }
}

async fn worker_iteration(core: &Core, worker_id: usize) -> CoreResult<()> {
    let db = core.db();
    let manager = core.worker_manager();

    let Some(row) = db.next_queued_target().await? else {
        // Queue is empty: notify batch consumers and back off.
        let _ = manager.empty_tx.send(());
        tokio::time::sleep(EMPTY_QUEUE_POLL_INTERVAL).await;
        return Ok(());
    };

    let target_id = row.id.clone();
    let task_id = row.task_id.clone();
    let input = parse_target_input(row.input_json.as_deref());

    // CAS claim: exactly one worker wins; everyone else moves on.
    if !db.claim_job(&target_id).await? {
        debug!(target_id = %target_id, worker_id, "Job claimed by another worker");
        return Ok(());
    }

    match input.kind.as_str() {
        "query" => {
            let query = input
                .target
                .get("query")
                .and_then(|q| q.as_str())
                .unwrap_or("")
                .to_string();
            info!(
                target_id = %target_id,
                task_id = %task_id,
                query = %truncate(&query, 100),
                worker_id,
                "Processing query target from queue"
            );
        }
        _ => {
            let url = input
                .target
                .get("url")
                .and_then(|u| u.as_str())
                .or_else(|| input.target.get("doi").and_then(|d| d.as_str()))
                .unwrap_or("");
            info!(
                target_id = %target_id,
                task_id = %task_id,
                url = %truncate(url, 100),
                worker_id,
                "Processing target from queue"
            );
        }
    }

    let state = match core.state(&task_id).await {
        Ok(state) => state,
        Err(e) => {
            error!(target_id = %target_id, task_id = %task_id, error = %e, "Failed to get exploration state");
            db.finish_job_failed(&target_id, &format!("Failed to get exploration state: {e}"))
                .await?;
            return Ok(());
        }
    };

    let options = merged_options(&input, &task_id, &target_id, worker_id);

    // The target runs as its own task so stop_task(mode=immediate) can
    // cancel it without touching the worker.
    let job = {
        let core = core.clone();
        let kind = input.kind.clone();
        let target = input.target.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            match kind.as_str() {
                "url" => {
                    let url = target.get("url").and_then(|u| u.as_str()).unwrap_or("");
                    core.collaborators()
                        .url_ingestor
                        .ingest_url(&task_id, url, &options)
                        .await
                }
                "doi" => {
                    let doi = target.get("doi").and_then(|d| d.as_str()).unwrap_or("");
                    core.collaborators()
                        .doi_ingestor
                        .ingest_doi(&task_id, doi, &options)
                        .await
                }
                _ => {
                    let query = target.get("query").and_then(|q| q.as_str()).unwrap_or("");
                    core.run_search(&task_id, query, &serde_json::Value::Object(options))
                        .await
                }
            }
        })
    };
    manager.register_job(&target_id, &task_id, job.abort_handle());

    let outcome = job.await;
    manager.unregister_job(&target_id);

    match outcome {
        Ok(Ok(result)) => {
            let output = serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());
            let auth_queued = result
                .get("auth_queued")
                .or_else(|| result.get("captcha_queued"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            if auth_queued {
                if db.finish_job_awaiting_auth(&target_id, &output).await? {
                    state.notify_status_change();
                    info!(target_id = %target_id, task_id = %task_id, "Target awaiting auth");
                }
            } else if db.finish_job_completed(&target_id, &output).await? {
                state.notify_status_change();
                info!(
                    target_id = %target_id,
                    task_id = %task_id,
                    target_kind = %input.kind,
                    status = %result.get("status").and_then(|s| s.as_str()).unwrap_or("unknown"),
                    pages_fetched = result.get("pages_fetched").and_then(|p| p.as_u64()).unwrap_or(0),
                    "Target completed from queue"
                );
                enqueue_verify_nli(core, &task_id).await;
            } else {
                // Cancelled while we were finishing: the cancelled state
                // stands and completion is not logged.
                info!(
                    target_id = %target_id,
                    task_id = %task_id,
                    "Target completion skipped (job already cancelled)"
                );
            }
        }
        Ok(Err(e)) => {
            db.finish_job_failed(&target_id, &e.to_string()).await?;
            state.notify_status_change();
            error!(
                target_id = %target_id,
                task_id = %task_id,
                target_kind = %input.kind,
                error = %e,
                "Target failed from queue"
            );
        }
        Err(join_error) => {
            if join_error.is_cancelled() {
                // stop_task(mode=immediate) cancelled this target; the
                // worker itself keeps running.
                db.finish_job_cancelled(&target_id).await?;
                state.notify_status_change();
                info!(target_id = %target_id, task_id = %task_id, "Target cancelled from queue");
            } else {
                db.finish_job_failed(&target_id, &format!("target panicked: {join_error}"))
                    .await?;
                state.notify_status_change();
                error!(target_id = %target_id, task_id = %task_id, error = %join_error, "Target panicked");
            }
        }
    }

    Ok(())
}

/// Cross-source NLI verification runs per completed target. Always
/// enqueued: the verifier handles empty claim sets gracefully, and claims
/// produced through academic APIs would otherwise be missed. Enqueue
/// failure never fails the target.
async fn enqueue_verify_nli(core: &Core, task_id: &str) {
    debug!(task_id, "Enqueuing VERIFY_NLI job after target completion");
    if let Err(e) = core.db().enqueue_job(task_id, "verify_nli", 1, None).await {
        warn!(task_id, error = %e, "Failed to enqueue VERIFY_NLI job");
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_input_defaults_to_query_kind() {
        let input = parse_target_input(None);
        assert_eq!(input.kind, "query");
        assert!(input.options.is_empty());

        let input = parse_target_input(Some("not valid json"));
        assert_eq!(input.kind, "query");
    }

    #[test]
    fn target_options_override_task_options() {
        let input = parse_target_input(Some(
            r#"{
                "target": {"kind": "query", "query": "q", "options": {"max_pages": 5}},
                "options": {"max_pages": 20, "seek_primary": true}
            }"#,
        ));
        let merged = merged_options(&input, "t1", "job1", 1);
        assert_eq!(merged["max_pages"], 5);
        assert_eq!(merged["seek_primary"], true);
        assert_eq!(merged["task_id"], "t1");
        assert_eq!(merged["target_job_id"], "job1");
        assert_eq!(merged["worker_id"], 1);
    }
}
