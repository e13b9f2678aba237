//! Exploration state management
//!
//! The authoritative per-task state container: search registry, metrics,
//! budget tracking, novelty stop detection, and the long-poll status
//! projection consumed by the external strategic agent. The agent makes
//! every strategic decision; this module only reports facts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::collaborators::EvidenceGraph;
use crate::config::Settings;
use crate::error::CoreResult;
use crate::research::ucb::{Priority, UcbAllocator};
use crate::storage::{AuthQueueSummary, Database};

/// Recent-fragment window size for novelty scoring
pub const RECENT_FRAGMENT_WINDOW: usize = 20;

/// Default static page budget per search when UCB allocation is disabled
pub const DEFAULT_BUDGET_PER_SEARCH: u32 = 15;

/// Novelty threshold below which a search is considered mined out
const NOVELTY_STOP_THRESHOLD: f64 = 0.1;

/// Status of a search execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// Created but not executed
    Pending,
    /// Currently executing
    Running,
    /// Sufficient sources found
    Satisfied,
    /// Some sources found
    Partial,
    /// Budget consumed or novelty collapsed
    Exhausted,
    /// Manually skipped by the agent
    Skipped,
}

impl SearchStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStatus::Pending => "pending",
            SearchStatus::Running => "running",
            SearchStatus::Satisfied => "satisfied",
            SearchStatus::Partial => "partial",
            SearchStatus::Exhausted => "exhausted",
            SearchStatus::Skipped => "skipped",
        }
    }
}

/// Status of a research task.
///
/// `Paused` means "this session ended"; the task can be resumed with more
/// searches. Only `Failed` rejects new targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Exploring,
    AwaitingDecision,
    Paused,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Exploring => "exploring",
            TaskStatus::AwaitingDecision => "awaiting_decision",
            TaskStatus::Paused => "paused",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse a stored status; unknown values fall back to `Created`.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "exploring" => TaskStatus::Exploring,
            "awaiting_decision" => TaskStatus::AwaitingDecision,
            "paused" => TaskStatus::Paused,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Created,
        }
    }
}

/// Refutation status of a search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefutationStatus {
    Pending,
    Found,
    NotFound,
}

impl RefutationStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RefutationStatus::Pending => "pending",
            RefutationStatus::Found => "found",
            RefutationStatus::NotFound => "not_found",
        }
    }
}

/// State of a single search query
#[derive(Debug, Clone)]
pub struct SearchState {
    pub id: String,
    pub text: String,
    pub status: SearchStatus,
    pub priority: Priority,

    pub independent_sources: u32,
    pub has_primary_source: bool,
    pub source_domains: Vec<String>,

    pub pages_fetched: u32,
    pub useful_fragments: u32,
    /// Useful fragments per page; can exceed 1.0 when a page yields
    /// several fragments
    pub harvest_rate: f64,
    /// Ratio of novel fragments in the recent window
    pub novelty_score: f64,
    pub satisfaction_score: f64,

    pub refutation_status: RefutationStatus,
    pub refutation_count: u32,

    pub budget_pages: Option<u32>,
    pub budget_time_seconds: Option<u64>,
    pub time_started: Option<Instant>,

    /// (hash, is_useful, is_novel) for the most recent fragments
    recent_fragments: VecDeque<(String, bool, bool)>,
}

impl SearchState {
    fn new(id: String, text: String, priority: Priority) -> Self {
        Self {
            id,
            text,
            status: SearchStatus::Pending,
            priority,
            independent_sources: 0,
            has_primary_source: false,
            source_domains: Vec::new(),
            pages_fetched: 0,
            useful_fragments: 0,
            harvest_rate: 0.0,
            novelty_score: 1.0,
            satisfaction_score: 0.0,
            refutation_status: RefutationStatus::Pending,
            refutation_count: 0,
            budget_pages: None,
            budget_time_seconds: None,
            time_started: None,
            recent_fragments: VecDeque::with_capacity(RECENT_FRAGMENT_WINDOW),
        }
    }

    /// Satisfaction score:
    /// `min(1, 0.7 * min(1, independent_sources / 3) + 0.3 * [has_primary])`
    pub fn calculate_satisfaction_score(&mut self) -> f64 {
        let source_component = (self.independent_sources as f64 / 3.0).min(1.0) * 0.7;
        let primary_component = if self.has_primary_source { 0.3 } else { 0.0 };
        self.satisfaction_score = (source_component + primary_component).min(1.0);
        self.satisfaction_score
    }

    /// Satisfied iff the score reaches 0.8
    pub fn is_satisfied(&mut self) -> bool {
        self.calculate_satisfaction_score() >= 0.8
    }

    /// Recompute status from current metrics. Skipped searches stay skipped.
    pub fn update_status(&mut self) -> SearchStatus {
        if self.status == SearchStatus::Skipped {
            return self.status;
        }
        if self.is_satisfied() {
            self.status = SearchStatus::Satisfied;
        } else if self.independent_sources > 0 {
            self.status = SearchStatus::Partial;
        } else if self.novelty_score < NOVELTY_STOP_THRESHOLD && self.pages_fetched > 10 {
            self.status = SearchStatus::Exhausted;
        }
        self.status
    }

    /// Record a fragment into the recent window and refresh novelty and
    /// harvest metrics.
    pub fn add_fragment(&mut self, fragment_hash: &str, is_useful: bool, is_novel: bool) {
        if self.recent_fragments.len() == RECENT_FRAGMENT_WINDOW {
            self.recent_fragments.pop_front();
        }
        self.recent_fragments
            .push_back((fragment_hash.to_string(), is_useful, is_novel));

        if is_useful {
            self.useful_fragments += 1;
        }

        let novel = self
            .recent_fragments
            .iter()
            .filter(|(_, _, novel)| *novel)
            .count();
        self.novelty_score = novel as f64 / self.recent_fragments.len() as f64;

        if self.pages_fetched > 0 {
            self.harvest_rate = self.useful_fragments as f64 / self.pages_fetched as f64;
        }
    }

    /// Per-search entry of the status projection
    #[must_use]
    pub fn report(&self) -> SearchReport {
        SearchReport {
            id: self.id.clone(),
            text: self.text.clone(),
            status: self.status,
            priority: self.priority,
            independent_sources: self.independent_sources,
            has_primary_source: self.has_primary_source,
            pages_fetched: self.pages_fetched,
            useful_fragments: self.useful_fragments,
            harvest_rate: self.harvest_rate,
            novelty_score: self.novelty_score,
            satisfaction_score: self.satisfaction_score,
            refutation_status: self.refutation_status,
        }
    }
}

/// Serialized per-search status
#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub id: String,
    pub text: String,
    pub status: SearchStatus,
    pub priority: Priority,
    pub independent_sources: u32,
    pub has_primary_source: bool,
    pub pages_fetched: u32,
    pub useful_fragments: u32,
    pub harvest_rate: f64,
    pub novelty_score: f64,
    pub satisfaction_score: f64,
    pub refutation_status: RefutationStatus,
}

/// Aggregate metrics of the status projection
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusMetrics {
    pub satisfied_count: u32,
    pub partial_count: u32,
    pub pending_count: u32,
    pub exhausted_count: u32,
    pub total_pages: u32,
    pub total_fragments: u64,
    pub total_claims: u64,
    pub elapsed_seconds: u64,
}

/// Budget section of the status projection
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusBudget {
    pub pages_used: u32,
    pub pages_limit: u32,
    pub time_used_seconds: u64,
    pub time_limit_seconds: u64,
}

impl StatusBudget {
    /// Remaining pages
    #[must_use]
    pub fn pages_remaining(&self) -> u32 {
        self.pages_limit.saturating_sub(self.pages_used)
    }

    /// Remaining budget as an integer percentage
    #[must_use]
    pub fn percent_remaining(&self) -> u32 {
        if self.pages_limit == 0 {
            return 0;
        }
        ((1.0 - self.pages_used as f64 / self.pages_limit as f64) * 100.0) as u32
    }
}

/// UCB section of the status projection: raw arm data only, never a
/// recommendation string; the external agent stays the strategic decider.
#[derive(Debug, Clone, Serialize)]
pub struct UcbScores {
    pub enabled: bool,
    pub arm_scores: std::collections::HashMap<String, f64>,
    pub arm_budgets: std::collections::HashMap<String, u32>,
}

/// Full status projection returned by `get_status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub ok: bool,
    pub task_id: String,
    pub task_status: TaskStatus,
    pub searches: Vec<SearchReport>,
    pub metrics: StatusMetrics,
    pub budget: StatusBudget,
    pub ucb_scores: Option<UcbScores>,
    pub authentication_queue: Option<AuthQueueSummary>,
    pub warnings: Vec<String>,
    pub idle_seconds: u64,
    /// Forward-compatible extension fields, flattened into the top level
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

/// Finalization summary returned by `finalize`
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub ok: bool,
    pub task_id: String,
    pub final_status: String,
    pub summary: FinalizeSummary,
    pub followup_suggestions: Vec<String>,
    pub evidence_graph_summary: EvidenceGraphSummary,
    pub is_resumable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeSummary {
    pub satisfied_searches: u32,
    pub partial_searches: u32,
    pub unsatisfied_searches: Vec<String>,
    pub total_claims: u64,
    pub verified_claims: u64,
    pub refuted_claims: u64,
    pub unverified_claims: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceGraphSummary {
    pub nodes: u64,
    pub edges: u64,
    pub primary_source_ratio: f64,
}

/// Set/clear event for long polling.
///
/// A set that fires before the waiter parks is remembered, matching
/// set-then-clear event semantics: the next wait returns immediately.
pub(crate) struct StatusEvent {
    set: AtomicBool,
    notify: Notify,
}

impl StatusEvent {
    fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn fire(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.set.swap(false, Ordering::SeqCst) {
                return true;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Re-check after registering interest so a fire between the
            // check and the park is not lost.
            if self.set.swap(false, Ordering::SeqCst) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.set.swap(false, Ordering::SeqCst);
            }
        }
    }
}

struct StateInner {
    task_status: TaskStatus,
    task_hypothesis: String,
    searches: Vec<SearchState>,
    budget_pages_limit: u32,
    time_limit_seconds: u64,
    budget_pages_used: u32,
    time_started: Option<Instant>,
    ucb: Option<UcbAllocator>,
    total_fragments: u64,
    total_claims: u64,
    verified_claims: u64,
    refuted_claims: u64,
    /// Low-novelty observations, cleared on any spike
    novelty_history: Vec<f64>,
}

impl StateInner {
    fn search(&self, search_id: &str) -> Option<&SearchState> {
        self.searches.iter().find(|s| s.id == search_id)
    }

    fn search_mut(&mut self, search_id: &str) -> Option<&mut SearchState> {
        self.searches.iter_mut().find(|s| s.id == search_id)
    }
}

/// Per-task exploration state.
///
/// Owned exclusively by its task for the duration of a session; shared
/// across workers and status readers behind an `Arc`.
pub struct ExplorationState {
    task_id: String,
    db: Database,
    settings: Arc<Settings>,
    graph: Arc<dyn EvidenceGraph>,
    inner: parking_lot::Mutex<StateInner>,
    status_event: StatusEvent,
    last_activity: parking_lot::Mutex<Instant>,
}

impl ExplorationState {
    /// Create state for a task. UCB allocation is enabled unless the caller
    /// opts out; `ucb_exploration_constant` of None uses sqrt(2).
    pub fn new(
        task_id: impl Into<String>,
        db: Database,
        settings: Arc<Settings>,
        graph: Arc<dyn EvidenceGraph>,
        enable_ucb: bool,
        ucb_exploration_constant: Option<f64>,
    ) -> Self {
        let task_id = task_id.into();
        let budget_pages_limit = settings.task_limits.budget_pages_per_task;
        let time_limit_seconds = settings.task_time_limit_seconds();

        let ucb = if enable_ucb {
            info!(task_id = %task_id, total_budget = budget_pages_limit, "UCB allocator enabled");
            Some(UcbAllocator::new(budget_pages_limit, ucb_exploration_constant))
        } else {
            None
        };

        Self {
            task_id,
            db,
            settings,
            graph,
            inner: parking_lot::Mutex::new(StateInner {
                task_status: TaskStatus::Created,
                task_hypothesis: String::new(),
                searches: Vec::new(),
                budget_pages_limit,
                time_limit_seconds,
                budget_pages_used: 0,
                time_started: None,
                ucb,
                total_fragments: 0,
                total_claims: 0,
                verified_claims: 0,
                refuted_claims: 0,
                novelty_history: Vec::new(),
            }),
            status_event: StatusEvent::new(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    #[must_use]
    pub fn task_status(&self) -> TaskStatus {
        self.inner.lock().task_status
    }

    pub fn set_task_status(&self, status: TaskStatus) {
        self.inner.lock().task_status = status;
    }

    #[must_use]
    pub fn task_hypothesis(&self) -> String {
        self.inner.lock().task_hypothesis.clone()
    }

    // =========================================================================
    // Activity tracking
    // =========================================================================

    /// Record agent/worker activity for idle-timeout tracking
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Seconds since the last recorded activity
    #[must_use]
    pub fn idle_seconds(&self) -> u64 {
        self.last_activity.lock().elapsed().as_secs()
    }

    // =========================================================================
    // Long polling
    // =========================================================================

    /// Wake any `get_status(wait)` callers blocked on this task. Called
    /// after a search completes, fails, or is cancelled, and only after
    /// the corresponding store transition, so a woken reader always sees
    /// the new state.
    pub fn notify_status_change(&self) {
        self.status_event.fire();
    }

    /// Block until a status change or the timeout. Returns true when a
    /// change occurred.
    pub async fn wait_for_change(&self, timeout: Duration) -> bool {
        self.status_event.wait(timeout).await
    }

    // =========================================================================
    // Search registry
    // =========================================================================

    /// Register a search. Idempotent: re-registering an existing id returns
    /// the current state unchanged.
    pub fn register_search(
        &self,
        search_id: &str,
        text: &str,
        priority: Priority,
        budget_pages: Option<u32>,
        budget_time_seconds: Option<u64>,
    ) -> SearchState {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.search(search_id) {
            return existing.clone();
        }

        let mut search = SearchState::new(search_id.to_string(), text.to_string(), priority);
        search.budget_pages = budget_pages;
        search.budget_time_seconds = budget_time_seconds;
        let snapshot = search.clone();
        inner.searches.push(search);

        if let Some(ucb) = inner.ucb.as_mut() {
            ucb.register_search(search_id, priority, budget_pages);
        }

        info!(task_id = %self.task_id, search_id, priority = priority.as_str(), "Registered search");
        snapshot
    }

    /// Transition a search to running and the task to exploring
    pub fn start_search(&self, search_id: &str) -> Option<SearchState> {
        let mut inner = self.inner.lock();
        if inner.time_started.is_none() {
            inner.time_started = Some(Instant::now());
        }
        inner.task_status = TaskStatus::Exploring;
        let search = inner.search_mut(search_id)?;
        search.status = SearchStatus::Running;
        search.time_started = Some(Instant::now());
        Some(search.clone())
    }

    #[must_use]
    pub fn get_search(&self, search_id: &str) -> Option<SearchState> {
        self.inner.lock().search(search_id).cloned()
    }

    #[must_use]
    pub fn search_count(&self) -> usize {
        self.inner.lock().searches.len()
    }

    /// Mark a search's refutation outcome
    pub fn set_refutation_status(&self, search_id: &str, status: RefutationStatus, count: u32) {
        let mut inner = self.inner.lock();
        if let Some(search) = inner.search_mut(search_id) {
            search.refutation_status = status;
            search.refutation_count = count;
        }
    }

    // =========================================================================
    // Observation recording
    // =========================================================================

    /// Record a page fetch: page counters, independent-source set, primary
    /// flag, and a status recompute.
    pub fn record_page_fetch(
        &self,
        search_id: &str,
        domain: &str,
        is_primary_source: bool,
        is_independent: bool,
    ) {
        let mut inner = self.inner.lock();
        let Some(search) = inner.search_mut(search_id) else {
            return;
        };
        search.pages_fetched += 1;
        if is_independent {
            search.independent_sources += 1;
            if !search.source_domains.iter().any(|d| d == domain) {
                search.source_domains.push(domain.to_string());
            }
        }
        if is_primary_source {
            search.has_primary_source = true;
        }
        search.update_status();
        inner.budget_pages_used += 1;
    }

    /// Record a fragment extraction and forward the usefulness signal to
    /// the UCB allocator as the arm's reward.
    pub fn record_fragment(
        &self,
        search_id: &str,
        fragment_hash: &str,
        is_useful: bool,
        is_novel: bool,
    ) {
        let mut inner = self.inner.lock();
        let Some(search) = inner.search_mut(search_id) else {
            return;
        };
        search.add_fragment(fragment_hash, is_useful, is_novel);
        inner.total_fragments += 1;
        if let Some(ucb) = inner.ucb.as_mut() {
            ucb.record_observation(search_id, is_useful);
        }
    }

    /// Pure counter update; claim rows are persisted by the executor.
    pub fn record_claim(&self, _search_id: &str, is_verified: bool, is_refuted: bool) {
        let mut inner = self.inner.lock();
        inner.total_claims += 1;
        if is_verified {
            inner.verified_claims += 1;
        }
        if is_refuted {
            inner.refuted_claims += 1;
        }
    }

    pub fn record_claim_verified(&self) {
        self.inner.lock().verified_claims += 1;
    }

    pub fn record_claim_refuted(&self) {
        self.inner.lock().refuted_claims += 1;
    }

    // =========================================================================
    // Budgets
    // =========================================================================

    /// Check the task budget. Returns `(within_budget, warning)`; the
    /// warning is set when less than 20% of the page budget remains.
    #[must_use]
    pub fn check_budget(&self) -> (bool, Option<String>) {
        let inner = self.inner.lock();
        if inner.budget_pages_used >= inner.budget_pages_limit {
            return (false, Some("Page budget reached".to_string()));
        }
        if let Some(started) = inner.time_started {
            if started.elapsed().as_secs() >= inner.time_limit_seconds {
                return (false, Some("Time limit reached".to_string()));
            }
        }
        let remaining_ratio =
            1.0 - inner.budget_pages_used as f64 / inner.budget_pages_limit as f64;
        if remaining_ratio < 0.2 {
            return (
                true,
                Some(format!("Budget remaining {}%", (remaining_ratio * 100.0) as u32)),
            );
        }
        (true, None)
    }

    /// Dynamic page budget for a search: UCB allocation when enabled, the
    /// static per-search budget otherwise (default 15).
    #[must_use]
    pub fn get_dynamic_budget(&self, search_id: &str) -> u32 {
        let mut inner = self.inner.lock();
        let (budget_pages, pages_fetched) = match inner.search(search_id) {
            Some(search) => (search.budget_pages, search.pages_fetched),
            None => return 0,
        };
        if let Some(ucb) = inner.ucb.as_mut() {
            return ucb.reallocate_and_get_budget(search_id);
        }
        match budget_pages {
            Some(budget) => budget.saturating_sub(pages_fetched),
            None => DEFAULT_BUDGET_PER_SEARCH,
        }
    }

    /// Novelty stop: after at least 20 pages, true when the novelty score
    /// has stayed below 10% for two consecutive observation cycles. Any
    /// novelty spike resets the cycle history.
    #[must_use]
    pub fn check_novelty_stop_condition(&self, search_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(search) = inner.search(search_id) else {
            return false;
        };
        if search.pages_fetched < 20 {
            return false;
        }
        let novelty = search.novelty_score;
        if novelty < NOVELTY_STOP_THRESHOLD {
            inner.novelty_history.push(novelty);
            let n = inner.novelty_history.len();
            if n >= 2
                && inner.novelty_history[n - 2..]
                    .iter()
                    .all(|v| *v < NOVELTY_STOP_THRESHOLD)
            {
                return true;
            }
        } else {
            inner.novelty_history.clear();
        }
        false
    }

    /// Harvest rate across all searches
    #[must_use]
    pub fn overall_harvest_rate(&self) -> f64 {
        let inner = self.inner.lock();
        let total_pages: u32 = inner.searches.iter().map(|s| s.pages_fetched).sum();
        if total_pages == 0 {
            return 0.0;
        }
        let total_useful: u32 = inner.searches.iter().map(|s| s.useful_fragments).sum();
        total_useful as f64 / total_pages as f64
    }

    /// Current budget numbers
    #[must_use]
    pub fn budget_snapshot(&self) -> StatusBudget {
        let inner = self.inner.lock();
        StatusBudget {
            pages_used: inner.budget_pages_used,
            pages_limit: inner.budget_pages_limit,
            time_used_seconds: inner
                .time_started
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            time_limit_seconds: inner.time_limit_seconds,
        }
    }

    /// UCB-recommended next search, for observability only
    #[must_use]
    pub fn ucb_recommended_search(&self) -> Option<String> {
        self.inner.lock().ucb.as_ref()?.recommended_search()
    }

    /// Manually trigger a budget reallocation
    pub fn trigger_budget_reallocation(&self) -> std::collections::HashMap<String, u32> {
        let mut inner = self.inner.lock();
        match inner.ucb.as_mut() {
            Some(ucb) => ucb.reallocate_budget(),
            None => std::collections::HashMap::new(),
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Reload task status, hypothesis, registered searches, and aggregate
    /// counters from the store. Counters are re-derived by counting rows,
    /// never read back from cached fields, which prevents drift across
    /// restarts.
    pub async fn load_state(&self) -> CoreResult<()> {
        let task = self.db.fetch_task(&self.task_id).await?;
        let queries = self.db.queries_for_task(&self.task_id).await?;
        let claims = self.db.claim_count(&self.task_id).await?;
        let metrics = self.db.task_metrics(&self.task_id).await?;

        let mut inner = self.inner.lock();
        if let Some(task) = task {
            inner.task_status = TaskStatus::parse(&task.status);
            inner.task_hypothesis = task.hypothesis;
        }
        for q in queries {
            if inner.search(&q.id).is_none() {
                let mut search = SearchState::new(q.id.clone(), q.query_text, Priority::Medium);
                search.harvest_rate = q.harvest_rate;
                inner.searches.push(search);
            }
        }
        inner.total_claims = claims;
        inner.budget_pages_used = metrics.page_count as u32;
        inner.total_fragments = metrics.fragment_count;

        debug!(
            task_id = %self.task_id,
            claims,
            pages = metrics.page_count,
            fragments = metrics.fragment_count,
            "Loaded metrics from store"
        );
        Ok(())
    }

    /// Persist the task status. Only the status field is written;
    /// fine-grained counters are always re-derived on load.
    pub async fn save_state(&self) -> CoreResult<()> {
        let status = self.task_status();
        self.db
            .update_task_status(&self.task_id, status.as_str())
            .await
    }

    // =========================================================================
    // Status projection
    // =========================================================================

    /// Build the full status projection. Facts only, no recommendations.
    pub async fn status(&self) -> StatusReport {
        let authentication_queue = self
            .db
            .auth_queue_summary(&self.task_id)
            .await
            .unwrap_or_else(|e| {
                debug!(task_id = %self.task_id, error = %e, "Failed to get authentication queue summary");
                None
            });

        let idle_seconds = self.idle_seconds();
        let idle_timeout = self.settings.task_limits.cursor_idle_timeout_seconds;
        let (_, budget_warning) = self.check_budget();

        let inner = self.inner.lock();

        let count = |status: SearchStatus| {
            inner.searches.iter().filter(|s| s.status == status).count() as u32
        };
        let satisfied_count = count(SearchStatus::Satisfied);
        let partial_count = count(SearchStatus::Partial);
        let pending_count = count(SearchStatus::Pending);
        let exhausted_count = count(SearchStatus::Exhausted);

        let elapsed_seconds = inner
            .time_started
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);

        // Warnings in criticality order: authentication blocks, budget,
        // diminishing returns, idleness.
        let mut warnings = Vec::new();
        if let Some(auth) = &authentication_queue {
            if auth.pending_count >= 5 || auth.high_priority_count >= 2 {
                if auth.high_priority_count >= 2 {
                    warnings.push(format!(
                        "[critical] {} URLs awaiting authentication ({} high priority): primary-source access blocked",
                        auth.pending_count, auth.high_priority_count
                    ));
                } else {
                    warnings.push(format!(
                        "[critical] {} URLs awaiting authentication: exploration continuity at risk",
                        auth.pending_count
                    ));
                }
            } else if auth.pending_count >= 3 {
                let mut sample = auth.domains.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
                if auth.domains.len() > 3 {
                    sample.push_str(&format!(" +{} more", auth.domains.len() - 3));
                }
                warnings.push(format!(
                    "[warning] {} URLs awaiting authentication ({sample})",
                    auth.pending_count
                ));
            }
        }
        if let Some(warning) = budget_warning {
            warnings.push(warning);
        }
        if exhausted_count > 0 {
            warnings.push(format!(
                "{exhausted_count} searches stopped on diminishing returns"
            ));
        }
        if idle_seconds >= idle_timeout {
            warnings.push(format!(
                "Task idle for {idle_seconds} seconds (timeout: {idle_timeout}s). Consider resuming or stopping."
            ));
        }

        let ucb_scores = inner.ucb.as_ref().map(|ucb| {
            let statuses = ucb.arm_statuses();
            UcbScores {
                enabled: true,
                arm_scores: statuses
                    .iter()
                    .map(|a| (a.search_id.clone(), a.ucb_score))
                    .collect(),
                arm_budgets: statuses
                    .iter()
                    .map(|a| (a.search_id.clone(), a.remaining_budget))
                    .collect(),
            }
        });

        StatusReport {
            ok: true,
            task_id: self.task_id.clone(),
            task_status: inner.task_status,
            searches: inner.searches.iter().map(SearchState::report).collect(),
            metrics: StatusMetrics {
                satisfied_count,
                partial_count,
                pending_count,
                exhausted_count,
                total_pages: inner.budget_pages_used,
                total_fragments: inner.total_fragments,
                total_claims: inner.total_claims,
                elapsed_seconds,
            },
            budget: StatusBudget {
                pages_used: inner.budget_pages_used,
                pages_limit: inner.budget_pages_limit,
                time_used_seconds: elapsed_seconds,
                time_limit_seconds: inner.time_limit_seconds,
            },
            ucb_scores,
            authentication_queue,
            warnings,
            idle_seconds,
            extensions: serde_json::Map::new(),
        }
    }

    /// Status with optional long polling: a wait of zero returns
    /// immediately; otherwise the call blocks until a status-changing
    /// operation fires the event or the timeout elapses.
    pub async fn status_wait(&self, wait: Option<Duration>) -> StatusReport {
        if let Some(wait) = wait {
            if !wait.is_zero() {
                self.wait_for_change(wait).await;
            }
        }
        self.status().await
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// End the exploration session and summarize.
    ///
    /// The task transitions to `Paused` (resumable) for every reason;
    /// `final_status` is "cancelled" only when the reason is exactly
    /// `user_cancelled`, "paused" otherwise.
    pub async fn finalize(&self, reason: &str) -> FinalizeReport {
        let graph_stats = self.graph.stats(&self.task_id).await.ok();

        let mut inner = self.inner.lock();
        let final_status = if reason == "user_cancelled" {
            "cancelled"
        } else {
            "paused"
        };
        inner.task_status = TaskStatus::Paused;

        let satisfied: Vec<&SearchState> = inner
            .searches
            .iter()
            .filter(|s| s.status == SearchStatus::Satisfied)
            .collect();
        let partial: Vec<&SearchState> = inner
            .searches
            .iter()
            .filter(|s| s.status == SearchStatus::Partial)
            .collect();
        let unsatisfied: Vec<&SearchState> = inner
            .searches
            .iter()
            .filter(|s| {
                matches!(s.status, SearchStatus::Pending | SearchStatus::Exhausted)
            })
            .collect();

        let mut followup_suggestions = Vec::new();
        for s in &unsatisfied {
            match s.status {
                SearchStatus::Exhausted => followup_suggestions.push(format!(
                    "{}: stopped on diminishing returns; needs a different query strategy",
                    s.id
                )),
                SearchStatus::Pending => {
                    followup_suggestions.push(format!("{}: not executed", s.id));
                }
                _ => {}
            }
        }
        for s in &partial {
            if !s.has_primary_source {
                followup_suggestions.push(format!("{}: no primary source found", s.id));
            }
        }

        let refuted_from_searches = inner
            .searches
            .iter()
            .filter(|s| s.refutation_status == RefutationStatus::Found)
            .count() as u64;
        let total_refuted = inner.refuted_claims.max(refuted_from_searches);
        let unverified_claims = inner
            .total_claims
            .saturating_sub(inner.verified_claims)
            .saturating_sub(total_refuted);

        let with_primary = inner
            .searches
            .iter()
            .filter(|s| s.has_primary_source)
            .count() as f64;
        let primary_source_ratio = with_primary / (inner.searches.len().max(1) as f64);

        let evidence_graph_summary = match graph_stats {
            Some(stats) => EvidenceGraphSummary {
                nodes: stats.total_nodes,
                edges: stats.total_edges,
                primary_source_ratio,
            },
            None => EvidenceGraphSummary {
                nodes: inner.total_fragments + inner.total_claims,
                edges: 0,
                primary_source_ratio,
            },
        };

        FinalizeReport {
            ok: true,
            task_id: self.task_id.clone(),
            final_status: final_status.to_string(),
            summary: FinalizeSummary {
                satisfied_searches: satisfied.len() as u32,
                partial_searches: partial.len() as u32,
                unsatisfied_searches: unsatisfied.iter().map(|s| s.id.clone()).collect(),
                total_claims: inner.total_claims,
                verified_claims: inner.verified_claims,
                refuted_claims: total_refuted,
                unverified_claims,
            },
            followup_suggestions,
            evidence_graph_summary,
            is_resumable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        Citation, ClaimEvidence, CitationEdge, GraphStats, NodeType,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct NullGraph;

    #[async_trait]
    impl EvidenceGraph for NullGraph {
        async fn add_node(&self, _: &str, _: NodeType, _: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn add_claim_evidence(&self, _: ClaimEvidence) -> CoreResult<()> {
            Ok(())
        }
        async fn add_citation(&self, _: CitationEdge) -> CoreResult<()> {
            Ok(())
        }
        async fn add_academic_page_with_citations(
            &self,
            _: &str,
            _: serde_json::Value,
            _: &[Citation],
            _: &str,
            _: &HashMap<String, String>,
        ) -> CoreResult<()> {
            Ok(())
        }
        async fn stats(&self, _: &str) -> CoreResult<GraphStats> {
            Ok(GraphStats::default())
        }
    }

    async fn state() -> ExplorationState {
        let db = Database::open_in_memory().await.expect("db");
        ExplorationState::new(
            "t_test",
            db,
            Arc::new(Settings::default()),
            Arc::new(NullGraph),
            true,
            None,
        )
    }

    #[tokio::test]
    async fn satisfaction_score_formula() {
        let s = state().await;
        s.register_search("s1", "query", Priority::Medium, None, None);

        s.record_page_fetch("s1", "a.example.com", false, true);
        let search = s.get_search("s1").expect("search");
        assert!((search.satisfaction_score - 0.7 / 3.0).abs() < 1e-9);
        assert_eq!(search.status, SearchStatus::Partial);

        s.record_page_fetch("s1", "b.example.com", false, true);
        s.record_page_fetch("s1", "c.example.com", true, true);
        let search = s.get_search("s1").expect("search");
        assert!((search.satisfaction_score - 1.0).abs() < 1e-9);
        assert_eq!(search.status, SearchStatus::Satisfied);
    }

    #[tokio::test]
    async fn register_search_is_idempotent() {
        let s = state().await;
        s.register_search("s1", "query", Priority::High, Some(10), None);
        let again = s.register_search("s1", "other text", Priority::Low, Some(99), None);
        assert_eq!(again.text, "query");
        assert_eq!(again.priority, Priority::High);
        assert_eq!(s.search_count(), 1);
    }

    #[tokio::test]
    async fn novelty_tracks_recent_window() {
        let s = state().await;
        s.register_search("s1", "query", Priority::Medium, None, None);
        s.start_search("s1");
        s.record_page_fetch("s1", "a.example.com", false, true);

        s.record_fragment("s1", "h1", true, true);
        s.record_fragment("s1", "h2", true, false);
        let search = s.get_search("s1").expect("search");
        assert!((search.novelty_score - 0.5).abs() < 1e-9);
        assert_eq!(search.useful_fragments, 2);
        assert!((search.harvest_rate - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn novelty_stop_needs_two_low_cycles_after_twenty_pages() {
        let s = state().await;
        s.register_search("s1", "query", Priority::Medium, None, None);
        for i in 0..20 {
            s.record_page_fetch("s1", &format!("d{i}.example.com"), false, false);
        }
        // Fill the window with non-novel fragments: novelty 0.0
        for i in 0..20 {
            s.record_fragment("s1", &format!("h{i}"), false, false);
        }
        assert!(!s.check_novelty_stop_condition("s1"));
        assert!(s.check_novelty_stop_condition("s1"));
    }

    #[tokio::test]
    async fn budget_warning_below_twenty_percent() {
        let s = state().await;
        s.register_search("s1", "query", Priority::Medium, None, None);
        for i in 0..100 {
            s.record_page_fetch("s1", &format!("d{i}.example.com"), false, false);
        }
        let (within, warning) = s.check_budget();
        assert!(within);
        let warning = warning.expect("warning below 20%");
        assert!(warning.contains("Budget remaining"));

        for i in 0..20 {
            s.record_page_fetch("s1", &format!("x{i}.example.com"), false, false);
        }
        let (within, _) = s.check_budget();
        assert!(!within);
    }

    #[tokio::test]
    async fn status_projection_shape() {
        let s = state().await;
        s.register_search("s1", "query", Priority::Medium, None, None);
        s.start_search("s1");

        let report = s.status().await;
        assert!(report.ok);
        assert_eq!(report.task_status, TaskStatus::Exploring);
        assert_eq!(report.searches.len(), 1);
        assert_eq!(report.budget.pages_limit, 120);
        assert!(report.ucb_scores.as_ref().map(|u| u.enabled).unwrap_or(false));
        assert!(report.authentication_queue.is_none());

        let value = serde_json::to_value(&report).expect("serialize");
        assert!(value.get("metrics").is_some());
        assert!(value.get("budget").is_some());
        assert!(value.get("idle_seconds").is_some());
    }

    #[tokio::test]
    async fn long_poll_wakes_on_notify() {
        let s = Arc::new(state().await);
        let waiter = Arc::clone(&s);
        let handle = tokio::spawn(async move {
            waiter.wait_for_change(Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        s.notify_status_change();
        let woke = handle.await.expect("join");
        assert!(woke);
    }

    #[tokio::test]
    async fn long_poll_times_out_without_change() {
        let s = state().await;
        let woke = s.wait_for_change(Duration::from_millis(100)).await;
        assert!(!woke);
    }

    #[tokio::test]
    async fn notify_before_wait_is_not_lost() {
        let s = state().await;
        s.notify_status_change();
        let woke = s.wait_for_change(Duration::from_millis(100)).await;
        assert!(woke);
    }

    #[tokio::test]
    async fn finalize_maps_reason_to_final_status() {
        let s = state().await;
        s.register_search("s1", "query", Priority::Medium, None, None);

        let report = s.finalize("session_completed").await;
        assert_eq!(report.final_status, "paused");
        assert!(report.is_resumable);
        assert_eq!(s.task_status(), TaskStatus::Paused);

        let report = s.finalize("user_cancelled").await;
        assert_eq!(report.final_status, "cancelled");
        assert_eq!(s.task_status(), TaskStatus::Paused);
    }

    #[tokio::test]
    async fn finalize_counts_and_followups() {
        let s = state().await;
        s.register_search("sat", "q1", Priority::Medium, None, None);
        s.register_search("pend", "q2", Priority::Medium, None, None);
        for (domain, primary) in [("a.com", false), ("b.com", false), ("c.gov", true)] {
            s.record_page_fetch("sat", domain, primary, true);
        }
        s.record_claim("sat", true, false);
        s.record_claim("sat", false, false);

        let report = s.finalize("session_completed").await;
        assert_eq!(report.summary.satisfied_searches, 1);
        assert_eq!(report.summary.unsatisfied_searches, vec!["pend".to_string()]);
        assert_eq!(report.summary.total_claims, 2);
        assert_eq!(report.summary.verified_claims, 1);
        assert_eq!(report.summary.unverified_claims, 1);
        assert!(report
            .followup_suggestions
            .iter()
            .any(|f| f.contains("not executed")));
        assert!((report.evidence_graph_summary.primary_source_ratio - 0.5).abs() < 1e-9);
    }
}
