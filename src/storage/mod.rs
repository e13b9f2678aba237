//! Persistent store for exploration state
//!
//! SQLite-backed relational store tracking tasks, queries, SERP items,
//! pages, fragments, claims, evidence edges, and the job queue. Uses WAL
//! mode for concurrent reads during writes and indexed lookups on the hot
//! paths (job dequeue, page-by-url, per-task aggregates).
//!
//! Fine-grained counters are always re-derived from these tables on load;
//! only the task status field is written back, which keeps the in-memory
//! projection and the store from drifting.

pub mod evidence_graph;

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::search::paper::{FetchMethod, PageType};

/// SQL schema for the exploration store
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    hypothesis TEXT NOT NULL DEFAULT '',
    query TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'created',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS queries (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    query_text TEXT NOT NULL,
    harvest_rate REAL NOT NULL DEFAULT 0,
    engines_used TEXT
);
CREATE INDEX IF NOT EXISTS idx_queries_task ON queries(task_id);

CREATE TABLE IF NOT EXISTS serp_items (
    id TEXT PRIMARY KEY,
    query_id TEXT NOT NULL,
    url TEXT NOT NULL,
    title TEXT,
    snippet TEXT,
    engine TEXT,
    rank INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_serp_items_query ON serp_items(query_id);

-- url is unique: the same URL always maps to the same page id across
-- re-observations; placeholders are upgraded in place.
CREATE TABLE IF NOT EXISTS pages (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL UNIQUE,
    domain TEXT NOT NULL,
    page_type TEXT NOT NULL,
    fetch_method TEXT NOT NULL,
    title TEXT,
    paper_metadata TEXT,
    fetched_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fragments (
    id TEXT PRIMARY KEY,
    page_id TEXT NOT NULL,
    fragment_type TEXT NOT NULL,
    text_content TEXT NOT NULL,
    heading_context TEXT,
    position INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fragments_page ON fragments(page_id);

CREATE TABLE IF NOT EXISTS claims (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    claim_text TEXT NOT NULL,
    confidence_score REAL NOT NULL DEFAULT 0,
    verification_notes TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_claims_task ON claims(task_id);

CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0,
    nli_label TEXT,
    nli_confidence REAL,
    source_domain_category TEXT,
    target_domain_category TEXT
);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_type, target_id);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    priority INTEGER NOT NULL DEFAULT 1,
    queued_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    input_json TEXT,
    output_json TEXT,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs(kind, state, priority, queued_at);
CREATE INDEX IF NOT EXISTS idx_jobs_task ON jobs(task_id);
"#;

/// Generate a short prefixed id, e.g. `page_1f9c02ab`
#[must_use]
pub fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..8])
}

/// A task row
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub hypothesis: String,
    pub query: String,
    pub status: String,
    pub created_at: String,
}

/// A query (search) row as reloaded for state reconstruction
#[derive(Debug, Clone)]
pub struct QueryRow {
    pub id: String,
    pub query_text: String,
    pub harvest_rate: f64,
}

/// A claim row
#[derive(Debug, Clone)]
pub struct ClaimRow {
    pub id: String,
    pub task_id: String,
    pub claim_text: String,
    pub confidence_score: f64,
    pub verification_notes: Option<String>,
}

/// A new page for `upsert_page`
#[derive(Debug, Clone)]
pub struct NewPage {
    pub url: String,
    pub domain: String,
    pub page_type: PageType,
    pub fetch_method: FetchMethod,
    pub title: Option<String>,
    pub paper_metadata: Option<serde_json::Value>,
}

/// A new evidence edge row
#[derive(Debug, Clone)]
pub struct NewEdge {
    pub source_type: String,
    pub source_id: String,
    pub target_type: String,
    pub target_id: String,
    pub relation: String,
    pub confidence: f64,
    pub nli_label: Option<String>,
    pub nli_confidence: Option<f64>,
    pub source_domain_category: Option<String>,
    pub target_domain_category: Option<String>,
}

/// A dequeued target job
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub task_id: String,
    pub input_json: Option<String>,
}

/// Authentication queue summary for a task
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AuthQueueSummary {
    pub pending_count: u64,
    pub high_priority_count: u64,
    pub domains: Vec<String>,
}

/// Per-task aggregate counters re-derived from the store
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskMetrics {
    pub page_count: u64,
    pub fragment_count: u64,
}

/// Page-id lookups cached per URL (hot path during dedup and citation
/// wiring)
const PAGE_CACHE_SIZE: usize = 1000;

/// The exploration store
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    /// Cache of recently queried page ids for fast repeated URL lookups
    page_cache: std::sync::Arc<tokio::sync::RwLock<lru::LruCache<String, String>>>,
}

fn new_page_cache() -> std::sync::Arc<tokio::sync::RwLock<lru::LruCache<String, String>>> {
    let capacity = std::num::NonZeroUsize::new(PAGE_CACHE_SIZE)
        .unwrap_or_else(|| panic!("page cache size must be nonzero"));
    std::sync::Arc::new(tokio::sync::RwLock::new(lru::LruCache::new(capacity)))
}

impl Database {
    /// Open (or create) the store at the given path.
    pub async fn open(db_path: &Path) -> CoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        debug!(path = %db_path.display(), "Opened exploration store");
        Ok(Self {
            pool,
            page_cache: new_page_cache(),
        })
    }

    /// Open an in-memory store (single connection, for tests and tooling).
    pub async fn open_in_memory() -> CoreResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self {
            pool,
            page_cache: new_page_cache(),
        })
    }

    /// Raw pool access for collaborators that share this store
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub async fn create_task(&self, id: &str, hypothesis: &str, query: &str) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO tasks (id, hypothesis, query, status, created_at)
             VALUES (?, ?, ?, 'created', ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(hypothesis)
        .bind(query)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_task(&self, id: &str) -> CoreResult<Option<TaskRow>> {
        let row = sqlx::query(
            "SELECT id, hypothesis, query, status, created_at FROM tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| TaskRow {
            id: r.get(0),
            hypothesis: r.get(1),
            query: r.get(2),
            status: r.get(3),
            created_at: r.get(4),
        }))
    }

    pub async fn update_task_status(&self, id: &str, status: &str) -> CoreResult<()> {
        sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Queries and SERP items
    // =========================================================================

    pub async fn insert_query(
        &self,
        id: &str,
        task_id: &str,
        query_text: &str,
        engines_used: Option<&str>,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO queries (id, task_id, query_text, harvest_rate, engines_used)
             VALUES (?, ?, ?, 0, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(task_id)
        .bind(query_text)
        .bind(engines_used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_query_harvest_rate(&self, id: &str, harvest_rate: f64) -> CoreResult<()> {
        sqlx::query("UPDATE queries SET harvest_rate = ? WHERE id = ?")
            .bind(harvest_rate)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn queries_for_task(&self, task_id: &str) -> CoreResult<Vec<QueryRow>> {
        let rows = sqlx::query("SELECT id, query_text, harvest_rate FROM queries WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| QueryRow {
                id: r.get(0),
                query_text: r.get(1),
                harvest_rate: r.get(2),
            })
            .collect())
    }

    pub async fn insert_serp_item(
        &self,
        query_id: &str,
        url: &str,
        title: &str,
        snippet: &str,
        engine: &str,
        rank: i64,
    ) -> CoreResult<String> {
        let id = short_id("serp");
        sqlx::query(
            "INSERT INTO serp_items (id, query_id, url, title, snippet, engine, rank)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(query_id)
        .bind(url)
        .bind(title)
        .bind(snippet)
        .bind(engine)
        .bind(rank)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    // =========================================================================
    // Pages and fragments
    // =========================================================================

    /// Insert a page row, or return the existing id for its URL.
    ///
    /// A placeholder row being replaced by a real fetch is upgraded in
    /// place: the page keeps its id, only type/method/title/metadata move.
    pub async fn upsert_page(&self, page: &NewPage) -> CoreResult<String> {
        let existing = sqlx::query("SELECT id, page_type FROM pages WHERE url = ?")
            .bind(&page.url)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = existing {
            let id: String = row.get(0);
            let existing_type: String = row.get(1);
            let is_placeholder = existing_type == PageType::CitationPlaceholder.as_str();
            if is_placeholder && page.page_type != PageType::CitationPlaceholder {
                sqlx::query(
                    "UPDATE pages
                     SET page_type = ?, fetch_method = ?, title = ?, paper_metadata = ?, fetched_at = ?
                     WHERE id = ?",
                )
                .bind(page.page_type.as_str())
                .bind(page.fetch_method.as_str())
                .bind(&page.title)
                .bind(page.paper_metadata.as_ref().map(|m| m.to_string()))
                .bind(Utc::now().to_rfc3339())
                .bind(&id)
                .execute(&self.pool)
                .await?;
                debug!(page_id = %id, url = %page.url, "Upgraded placeholder page in place");
            }
            return Ok(id);
        }

        let id = short_id("page");
        sqlx::query(
            "INSERT INTO pages (id, url, domain, page_type, fetch_method, title, paper_metadata, fetched_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&page.url)
        .bind(&page.domain)
        .bind(page.page_type.as_str())
        .bind(page.fetch_method.as_str())
        .bind(&page.title)
        .bind(page.paper_metadata.as_ref().map(|m| m.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.page_cache.write().await.put(page.url.clone(), id.clone());
        Ok(id)
    }

    pub async fn page_id_for_url(&self, url: &str) -> CoreResult<Option<String>> {
        {
            let cache = self.page_cache.read().await;
            if let Some(id) = cache.peek(url) {
                return Ok(Some(id.clone()));
            }
        }

        let row = sqlx::query("SELECT id FROM pages WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        let id: Option<String> = row.map(|r| r.get(0));

        if let Some(id) = &id {
            self.page_cache.write().await.put(url.to_string(), id.clone());
        }
        Ok(id)
    }

    pub async fn insert_fragment(
        &self,
        page_id: &str,
        fragment_type: &str,
        text_content: &str,
        heading_context: Option<&str>,
        position: i64,
    ) -> CoreResult<String> {
        let id = short_id("frag");
        sqlx::query(
            "INSERT INTO fragments (id, page_id, fragment_type, text_content, heading_context, position, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(page_id)
        .bind(fragment_type)
        .bind(text_content)
        .bind(heading_context)
        .bind(position)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn fragment_text(&self, fragment_id: &str) -> CoreResult<Option<String>> {
        let row = sqlx::query("SELECT text_content FROM fragments WHERE id = ?")
            .bind(fragment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    // =========================================================================
    // Claims and edges
    // =========================================================================

    pub async fn insert_claim(
        &self,
        id: &str,
        task_id: &str,
        claim_text: &str,
        confidence_score: f64,
        verification_notes: Option<&str>,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO claims (id, task_id, claim_text, confidence_score, verification_notes, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(task_id)
        .bind(claim_text)
        .bind(confidence_score)
        .bind(verification_notes)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetch_claim(&self, id: &str) -> CoreResult<Option<ClaimRow>> {
        let row = sqlx::query(
            "SELECT id, task_id, claim_text, confidence_score, verification_notes
             FROM claims WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ClaimRow {
            id: r.get(0),
            task_id: r.get(1),
            claim_text: r.get(2),
            confidence_score: r.get(3),
            verification_notes: r.get(4),
        }))
    }

    pub async fn update_claim_confidence(&self, id: &str, confidence: f64) -> CoreResult<()> {
        sqlx::query("UPDATE claims SET confidence_score = ? WHERE id = ?")
            .bind(confidence)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_edge(&self, edge: &NewEdge) -> CoreResult<String> {
        let id = short_id("edge");
        sqlx::query(
            "INSERT INTO edges (id, source_type, source_id, target_type, target_id,
                                relation, confidence, nli_label, nli_confidence,
                                source_domain_category, target_domain_category)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&edge.source_type)
        .bind(&edge.source_id)
        .bind(&edge.target_type)
        .bind(&edge.target_id)
        .bind(&edge.relation)
        .bind(edge.confidence)
        .bind(&edge.nli_label)
        .bind(edge.nli_confidence)
        .bind(&edge.source_domain_category)
        .bind(&edge.target_domain_category)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn edges_for_target(
        &self,
        target_type: &str,
        target_id: &str,
    ) -> CoreResult<Vec<(String, String, f64)>> {
        let rows = sqlx::query(
            "SELECT id, relation, confidence FROM edges WHERE target_type = ? AND target_id = ?",
        )
        .bind(target_type)
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get(0), r.get(1), r.get(2)))
            .collect())
    }

    // =========================================================================
    // Aggregates
    // =========================================================================

    pub async fn claim_count(&self, task_id: &str) -> CoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM claims WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    /// Pages and fragments reachable from this task's queries, via the
    /// queries -> serp_items -> pages -> fragments chain.
    pub async fn task_metrics(&self, task_id: &str) -> CoreResult<TaskMetrics> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT p.id), COUNT(DISTINCT f.id)
             FROM queries q
             JOIN serp_items s ON s.query_id = q.id
             JOIN pages p ON p.url = s.url
             LEFT JOIN fragments f ON f.page_id = p.id
             WHERE q.task_id = ?",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        let pages: i64 = row.get(0);
        let fragments: i64 = row.get(1);
        Ok(TaskMetrics {
            page_count: pages as u64,
            fragment_count: fragments as u64,
        })
    }

    pub async fn edge_count(&self) -> CoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM edges")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    // =========================================================================
    // Job queue
    // =========================================================================

    pub async fn enqueue_job(
        &self,
        task_id: &str,
        kind: &str,
        priority: i64,
        input_json: Option<&str>,
    ) -> CoreResult<String> {
        let id = short_id("job");
        sqlx::query(
            "INSERT INTO jobs (id, task_id, kind, state, priority, queued_at, input_json)
             VALUES (?, ?, ?, 'queued', ?, ?, ?)",
        )
        .bind(&id)
        .bind(task_id)
        .bind(kind)
        .bind(priority)
        .bind(Utc::now().to_rfc3339())
        .bind(input_json)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Next queued target, in dispatch order: priority ASC (high first),
    /// then queued_at ASC (FIFO within a priority band).
    pub async fn next_queued_target(&self) -> CoreResult<Option<JobRow>> {
        let row = sqlx::query(
            "SELECT id, task_id, input_json
             FROM jobs
             WHERE kind = 'target_queue' AND state = 'queued'
             ORDER BY priority ASC, queued_at ASC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| JobRow {
            id: r.get(0),
            task_id: r.get(1),
            input_json: r.get(2),
        }))
    }

    /// Atomically claim a queued job. Returns false when another worker won
    /// the race; the caller just moves on.
    pub async fn claim_job(&self, id: &str) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'running', started_at = ? WHERE id = ? AND state = 'queued'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Conditionally complete a running job. Returns false when the job was
    /// cancelled underneath us, in which case the cancelled state stands.
    pub async fn finish_job_completed(&self, id: &str, output_json: &str) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'completed', finished_at = ?, output_json = ?
             WHERE id = ? AND state = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(output_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Park a running job until its blocked URL clears authentication.
    pub async fn finish_job_awaiting_auth(&self, id: &str, output_json: &str) -> CoreResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'awaiting_auth', finished_at = ?, output_json = ?
             WHERE id = ? AND state = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(output_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn finish_job_failed(&self, id: &str, error_message: &str) -> CoreResult<()> {
        let truncated: String = error_message.chars().take(1000).collect();
        sqlx::query(
            "UPDATE jobs SET state = 'failed', finished_at = ?, error_message = ?
             WHERE id = ? AND state = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(truncated)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_job_cancelled(&self, id: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE jobs SET state = 'cancelled', finished_at = ?
             WHERE id = ? AND state = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn job_state(&self, id: &str) -> CoreResult<Option<String>> {
        let row = sqlx::query("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Summary of jobs parked on authentication for a task. Returns None
    /// when nothing is pending so the status projection can omit the block.
    pub async fn auth_queue_summary(&self, task_id: &str) -> CoreResult<Option<AuthQueueSummary>> {
        let rows = sqlx::query(
            "SELECT priority, input_json FROM jobs
             WHERE task_id = ? AND state = 'awaiting_auth'",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut summary = AuthQueueSummary::default();
        for row in rows {
            summary.pending_count += 1;
            let priority: i64 = row.get(0);
            if priority == 0 {
                summary.high_priority_count += 1;
            }
            let input: Option<String> = row.get(1);
            if let Some(domain) = input
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
                .and_then(|v| {
                    v.pointer("/target/url")
                        .and_then(|u| u.as_str())
                        .and_then(|u| url::Url::parse(u).ok())
                })
                .and_then(|u| u.host_str().map(str::to_string))
            {
                if !summary.domains.contains(&domain) {
                    summary.domains.push(domain);
                }
            }
        }
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn page_url_is_unique_and_placeholder_upgrades_in_place() {
        let db = Database::open_in_memory().await.expect("open db");

        let placeholder = NewPage {
            url: "https://example.org/a".to_string(),
            domain: "example.org".to_string(),
            page_type: PageType::CitationPlaceholder,
            fetch_method: FetchMethod::Placeholder,
            title: None,
            paper_metadata: None,
        };
        let id1 = db.upsert_page(&placeholder).await.expect("insert");

        let fetched = NewPage {
            url: "https://example.org/a".to_string(),
            domain: "example.org".to_string(),
            page_type: PageType::Html,
            fetch_method: FetchMethod::Browser,
            title: Some("A".to_string()),
            paper_metadata: None,
        };
        let id2 = db.upsert_page(&fetched).await.expect("upgrade");
        assert_eq!(id1, id2);

        let row = sqlx::query("SELECT page_type FROM pages WHERE id = ?")
            .bind(&id1)
            .fetch_one(db.pool())
            .await
            .expect("fetch");
        let page_type: String = row.get(0);
        assert_eq!(page_type, "html");
    }

    #[tokio::test]
    async fn job_claim_is_conditional() {
        let db = Database::open_in_memory().await.expect("open db");
        let id = db
            .enqueue_job("t1", "target_queue", 1, None)
            .await
            .expect("enqueue");

        assert!(db.claim_job(&id).await.expect("first claim"));
        assert!(!db.claim_job(&id).await.expect("second claim loses"));
    }

    #[tokio::test]
    async fn cancelled_job_is_not_overwritten_by_completion() {
        let db = Database::open_in_memory().await.expect("open db");
        let id = db
            .enqueue_job("t1", "target_queue", 0, None)
            .await
            .expect("enqueue");
        assert!(db.claim_job(&id).await.expect("claim"));

        db.finish_job_cancelled(&id).await.expect("cancel");
        let completed = db
            .finish_job_completed(&id, "{}")
            .await
            .expect("conditional completion");
        assert!(!completed);
        assert_eq!(db.job_state(&id).await.expect("state").as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn dispatch_order_is_priority_then_fifo() {
        let db = Database::open_in_memory().await.expect("open db");
        let low = db.enqueue_job("t1", "target_queue", 2, None).await.expect("low");
        let high = db.enqueue_job("t1", "target_queue", 0, None).await.expect("high");

        let next = db.next_queued_target().await.expect("dequeue").expect("job");
        assert_eq!(next.id, high);
        assert!(db.claim_job(&high).await.expect("claim high"));

        let next = db.next_queued_target().await.expect("dequeue").expect("job");
        assert_eq!(next.id, low);
    }
}
