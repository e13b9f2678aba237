//! Worker pool: claim safety, conditional completion, cancellation modes

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use scout_core::{Core, Database, Priority, Settings, StopMode};

use common::{recording_bundle, serp_item, StaticSerp};

async fn file_db(dir: &tempfile::TempDir) -> Database {
    Database::open(&dir.path().join("scout.db")).await.expect("db")
}

async fn wait_for_job_state(db: &Database, job_id: &str, expected: &str, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if db
            .job_state(job_id)
            .await
            .expect("job state")
            .as_deref()
            == Some(expected)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn racing_workers_claim_a_job_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = file_db(&dir).await;

    let job_id = db
        .enqueue_job("t1", "target_queue", 1, None)
        .await
        .expect("enqueue");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        let job_id = job_id.clone();
        handles.push(tokio::spawn(async move {
            db.claim_job(&job_id).await.expect("claim query")
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.expect("join") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn completed_target_enqueues_verify_nli_and_wakes_status_readers() {
    common::init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let db = file_db(&dir).await;
    let (collaborators, _graph) = recording_bundle();

    let core = Core::new(Settings::default(), db.clone(), collaborators);
    core.create_task("t_done", "hypothesis").await.expect("task");

    let enqueued = core
        .enqueue_target(
            "t_done",
            json!({"kind": "query", "query": "anything"}),
            Priority::High,
            None,
        )
        .await
        .expect("enqueue");
    assert_eq!(enqueued["ok"], true);
    let target_id = enqueued["target_id"].as_str().expect("target id").to_string();

    // A long-poll reader parked before the work completes
    let poller = {
        let core = core.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let status = core
                .get_status("t_done", Some(Duration::from_secs(10)))
                .await
                .expect("status");
            (started.elapsed(), status)
        })
    };

    core.start_workers().await;
    assert!(
        wait_for_job_state(&db, &target_id, "completed", Duration::from_secs(10)).await,
        "target should complete"
    );

    let (waited, status) = poller.await.expect("join");
    assert!(waited < Duration::from_secs(10), "reader woke early: {waited:?}");
    assert_eq!(status["task_id"], "t_done");

    // Every completion enqueues a cross-source verification job
    let row = sqlx::query("SELECT COUNT(*) FROM jobs WHERE task_id = ? AND kind = 'verify_nli'")
        .bind("t_done")
        .fetch_one(db.pool())
        .await
        .expect("count");
    let verify_jobs: i64 = sqlx::Row::get(&row, 0);
    assert!(verify_jobs >= 1);

    core.stop_workers().await;
}

#[tokio::test]
async fn immediate_stop_cancels_in_flight_target() {
    common::init_test_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let db = file_db(&dir).await;
    let (mut collaborators, _graph) = recording_bundle();
    collaborators.serp = Arc::new(StaticSerp::slow(
        vec![serp_item("https://example.com/slow", 1)],
        Duration::from_secs(30),
    ));

    let core = Core::new(Settings::default(), db.clone(), collaborators);
    core.create_task("t_cancel", "hypothesis").await.expect("task");

    let enqueued = core
        .enqueue_target(
            "t_cancel",
            json!({"kind": "query", "query": "slow query"}),
            Priority::Medium,
            None,
        )
        .await
        .expect("enqueue");
    let target_id = enqueued["target_id"].as_str().expect("target id").to_string();

    core.start_workers().await;
    assert!(
        wait_for_job_state(&db, &target_id, "running", Duration::from_secs(10)).await,
        "target should start"
    );

    let report = core
        .stop_task("t_cancel", StopMode::Immediate, None)
        .await
        .expect("stop");
    assert_eq!(report["final_status"], "paused");
    assert_eq!(report["is_resumable"], true);

    assert!(
        wait_for_job_state(&db, &target_id, "cancelled", Duration::from_secs(5)).await,
        "cancelled target must land in DB state 'cancelled'"
    );

    // The worker loop survives cancellation and processes the next target
    let enqueued = core
        .enqueue_target(
            "t_cancel",
            json!({"kind": "url", "url": "https://example.com/next"}),
            Priority::Medium,
            None,
        )
        .await
        .expect("enqueue second");
    let second_id = enqueued["target_id"].as_str().expect("id").to_string();
    assert!(
        wait_for_job_state(&db, &second_id, "completed", Duration::from_secs(10)).await,
        "worker should keep processing after a cancellation"
    );

    core.stop_workers().await;
}

#[tokio::test]
async fn user_cancelled_reason_marks_final_status_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = file_db(&dir).await;
    let (collaborators, _graph) = recording_bundle();
    let core = Core::new(Settings::default(), db, collaborators);
    core.create_task("t_user", "hypothesis").await.expect("task");

    let report = core
        .stop_task("t_user", StopMode::Graceful, Some("user_cancelled"))
        .await
        .expect("stop");
    assert_eq!(report["final_status"], "cancelled");
    // The task itself stays resumable
    assert_eq!(report["is_resumable"], true);
}

#[tokio::test]
async fn failed_task_rejects_new_targets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = file_db(&dir).await;
    let (collaborators, _graph) = recording_bundle();
    let core = Core::new(Settings::default(), db, collaborators);
    core.create_task("t_failed", "hypothesis").await.expect("task");

    let state = core.state("t_failed").await.expect("state");
    state.set_task_status(scout_core::TaskStatus::Failed);

    let rejected = core
        .enqueue_target(
            "t_failed",
            json!({"kind": "query", "query": "q"}),
            Priority::Medium,
            None,
        )
        .await
        .expect("call succeeds");
    assert_eq!(rejected["ok"], false);
    assert_eq!(rejected["error_code"], "task_failed");
}
