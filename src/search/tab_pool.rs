//! Browser tab pool and SERP engine rate limiting
//!
//! Manages a bounded pool of browser tabs for parallel SERP fetching. Each
//! search operation borrows a tab, uses it exclusively, then returns it;
//! released tabs are queued for reuse to keep browser overhead down.
//!
//! CAPTCHA and 403 responses shrink the effective tab limit. Browser pools
//! never auto-recover: the underlying cause (fingerprinting, IP block) is
//! rarely self-curing, so only a manual `reset_backoff()` restores the
//! configured limit. At the floor, further events still bump counters and
//! log operator-visible warnings.
//!
//! Worker isolation: each target-queue worker gets its own pool, profile,
//! and Chrome debug port, so one worker's backoff never starves another's.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{CoreError, CoreResult};

/// Interval between slot-availability checks while blocked on acquire
const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default timeout for tab acquisition
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Adaptive backoff state for a tab pool
#[derive(Debug, Clone)]
pub struct TabPoolBackoffState {
    /// Current effective limit (may be below the configured cap)
    pub effective_max_tabs: usize,
    /// Configured upper bound
    pub config_max_tabs: usize,
    pub last_captcha: Option<Instant>,
    pub last_403: Option<Instant>,
    pub backoff_active: bool,
    pub captcha_count: u32,
    pub error_403_count: u32,
}

impl TabPoolBackoffState {
    fn new(max_tabs: usize) -> Self {
        Self {
            effective_max_tabs: max_tabs,
            config_max_tabs: max_tabs,
            last_captcha: None,
            last_403: None,
            backoff_active: false,
            captcha_count: 0,
            error_403_count: 0,
        }
    }
}

/// Pool statistics for monitoring
#[derive(Debug, Clone)]
pub struct TabPoolStats {
    pub max_tabs: usize,
    pub total_tabs: usize,
    pub available_tabs: usize,
    pub active_tabs: usize,
    pub closed: bool,
    pub effective_max_tabs: usize,
    pub backoff_active: bool,
    pub captcha_count: u32,
    pub error_403_count: u32,
}

struct TabPoolInner<T> {
    /// Tabs created so far (never exceeds effective_max_tabs at creation time)
    created: usize,
    /// Released tabs awaiting reuse
    available: VecDeque<T>,
    /// Currently borrowed slot count
    active_count: usize,
    backoff: TabPoolBackoffState,
    closed: bool,
}

/// Pool of browser tabs with adaptive concurrency.
///
/// Generic over the tab handle so tests can run with stub tabs; production
/// code uses [`BrowserTabPool`] over chromiumoxide pages.
pub struct TabPool<T> {
    inner: parking_lot::Mutex<TabPoolInner<T>>,
    slot_available: Notify,
    acquire_timeout: Duration,
    decrease_step: usize,
}

impl<T: Send> TabPool<T> {
    /// Create a pool with the given tab limit.
    ///
    /// `max_tabs` of 0 is treated as 1: a pool with no tabs can never make
    /// progress.
    #[must_use]
    pub fn new(max_tabs: usize, acquire_timeout: Duration, decrease_step: usize) -> Self {
        let max_tabs = max_tabs.max(1);
        Self {
            inner: parking_lot::Mutex::new(TabPoolInner {
                created: 0,
                available: VecDeque::new(),
                active_count: 0,
                backoff: TabPoolBackoffState::new(max_tabs),
                closed: false,
            }),
            slot_available: Notify::new(),
            acquire_timeout,
            decrease_step: decrease_step.max(1),
        }
    }

    /// Acquire a tab for exclusive use.
    ///
    /// Reuses a released tab when one is queued; otherwise creates a new
    /// tab via `open_tab` while under the effective limit. Blocks on slot
    /// availability up to the pool's acquire timeout.
    pub async fn acquire<F, Fut>(&self, open_tab: F) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let start = Instant::now();
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(CoreError::TabPoolClosed);
                }
                if inner.active_count < inner.backoff.effective_max_tabs {
                    inner.active_count += 1;
                    if let Some(tab) = inner.available.pop_front() {
                        debug!(tabs = inner.created, "Reusing existing tab");
                        return Ok(tab);
                    }
                    if inner.created < inner.backoff.effective_max_tabs {
                        inner.created += 1;
                        break;
                    }
                    // Slot granted but every created tab is borrowed; keep
                    // waiting for a release without consuming the slot.
                    inner.active_count -= 1;
                }
                debug!(
                    active = inner.active_count,
                    effective_max = inner.backoff.effective_max_tabs,
                    "Backoff limiting: waiting for tab slot"
                );
            }

            let elapsed = start.elapsed();
            if elapsed >= self.acquire_timeout {
                let effective_max = self.inner.lock().backoff.effective_max_tabs;
                return Err(CoreError::TabAcquireTimeout {
                    timeout_secs: self.acquire_timeout.as_secs(),
                    effective_max,
                });
            }
            let wait = SLOT_POLL_INTERVAL.min(self.acquire_timeout - elapsed);
            let _ = tokio::time::timeout(wait, self.slot_available.notified()).await;
        }

        match open_tab().await {
            Ok(tab) => {
                debug!("Created new tab");
                Ok(tab)
            }
            Err(e) => {
                // Roll back the reservation so the slot is not leaked
                let mut inner = self.inner.lock();
                inner.created -= 1;
                inner.active_count -= 1;
                drop(inner);
                self.slot_available.notify_waiters();
                Err(e)
            }
        }
    }

    /// Return a tab to the pool. Call on every path after `acquire`.
    pub fn release(&self, tab: T) {
        let mut inner = self.inner.lock();
        if inner.closed {
            // Pool is closed; drop the tab instead of re-queueing it.
            if inner.active_count > 0 {
                inner.active_count -= 1;
            }
            return;
        }
        inner.available.push_back(tab);
        if inner.active_count > 0 {
            inner.active_count -= 1;
        }
        let available = inner.available.len();
        drop(inner);
        self.slot_available.notify_waiters();
        debug!(available, "Tab released");
    }

    /// Report a CAPTCHA detection: step-decrease the effective tab limit
    /// (floor 1). No auto-recovery; see `reset_backoff`.
    pub fn report_captcha(&self) {
        let mut inner = self.inner.lock();
        let backoff = &mut inner.backoff;
        backoff.last_captcha = Some(Instant::now());
        backoff.captcha_count += 1;
        backoff.backoff_active = true;

        let new_max = backoff.effective_max_tabs.saturating_sub(self.decrease_step).max(1);
        if new_max < backoff.effective_max_tabs {
            backoff.effective_max_tabs = new_max;
            warn!(
                new_effective_max = new_max,
                config_max = backoff.config_max_tabs,
                captcha_count = backoff.captcha_count,
                "TabPool backoff triggered (CAPTCHA): reducing effective_max_tabs"
            );
        } else {
            warn!(
                effective_max_tabs = backoff.effective_max_tabs,
                captcha_count = backoff.captcha_count,
                "TabPool at floor (CAPTCHA): already at minimum concurrency; check profile health"
            );
        }
    }

    /// Report a 403 response: same step-decrease as CAPTCHA, tracked under
    /// its own counter.
    pub fn report_403(&self) {
        let mut inner = self.inner.lock();
        let backoff = &mut inner.backoff;
        backoff.last_403 = Some(Instant::now());
        backoff.error_403_count += 1;
        backoff.backoff_active = true;

        let new_max = backoff.effective_max_tabs.saturating_sub(self.decrease_step).max(1);
        if new_max < backoff.effective_max_tabs {
            backoff.effective_max_tabs = new_max;
            warn!(
                new_effective_max = new_max,
                config_max = backoff.config_max_tabs,
                error_403_count = backoff.error_403_count,
                "TabPool backoff triggered (403): reducing effective_max_tabs"
            );
        } else {
            warn!(
                effective_max_tabs = backoff.effective_max_tabs,
                error_403_count = backoff.error_403_count,
                "TabPool at floor (403): already at minimum concurrency; check profile health"
            );
        }
    }

    /// Manually restore the configured tab limit and clear counters.
    ///
    /// The only recovery path for browser pools.
    pub fn reset_backoff(&self) {
        let mut inner = self.inner.lock();
        let backoff = &mut inner.backoff;
        backoff.effective_max_tabs = backoff.config_max_tabs;
        backoff.backoff_active = false;
        backoff.captcha_count = 0;
        backoff.error_403_count = 0;
        drop(inner);
        self.slot_available.notify_waiters();
        info!("TabPool backoff reset");
    }

    /// Close the pool and drop all queued tabs. Borrowed tabs are dropped
    /// as they are released.
    pub fn close(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let tabs: Vec<T> = inner.available.drain(..).collect();
        inner.created = 0;
        drop(inner);
        self.slot_available.notify_waiters();
        debug!("TabPool closed");
        tabs
    }

    /// Configured maximum number of tabs
    #[must_use]
    pub fn max_tabs(&self) -> usize {
        self.inner.lock().backoff.config_max_tabs
    }

    /// Current backoff state snapshot
    #[must_use]
    pub fn backoff_state(&self) -> TabPoolBackoffState {
        self.inner.lock().backoff.clone()
    }

    /// Pool statistics snapshot
    #[must_use]
    pub fn stats(&self) -> TabPoolStats {
        let inner = self.inner.lock();
        TabPoolStats {
            max_tabs: inner.backoff.config_max_tabs,
            total_tabs: inner.created,
            available_tabs: inner.available.len(),
            active_tabs: inner.active_count,
            closed: inner.closed,
            effective_max_tabs: inner.backoff.effective_max_tabs,
            backoff_active: inner.backoff.backoff_active,
            captcha_count: inner.backoff.captcha_count,
            error_403_count: inner.backoff.error_403_count,
        }
    }
}

/// Production tab pool over chromiumoxide pages
pub type BrowserTabPool = TabPool<chromiumoxide::Page>;

/// Chrome endpoint identity for one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserEndpoint {
    /// Remote debugging port: `base_port + worker_id`
    pub debug_port: u16,
    /// Profile directory name: `{prefix}{worker_id:02}`
    pub profile: String,
}

/// Per-worker tab pool registry.
///
/// `get(worker_id)` returns the worker's singleton pool, creating it from
/// config on first use. Pools are never shared between workers.
pub struct TabPoolRegistry<T> {
    pools: parking_lot::Mutex<HashMap<usize, Arc<TabPool<T>>>>,
    settings: Arc<Settings>,
}

impl<T: Send> TabPoolRegistry<T> {
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            pools: parking_lot::Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// The singleton pool for a worker
    #[must_use]
    pub fn get(&self, worker_id: usize) -> Arc<TabPool<T>> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&worker_id) {
            return Arc::clone(pool);
        }
        let max_tabs = self.settings.concurrency.browser_serp.max_tabs;
        let decrease_step = self.settings.concurrency.backoff.browser_serp.decrease_step;
        let pool = Arc::new(TabPool::new(max_tabs, DEFAULT_ACQUIRE_TIMEOUT, decrease_step));
        info!(worker_id, max_tabs, "Created TabPool for worker");
        pools.insert(worker_id, Arc::clone(&pool));
        pool
    }

    /// Chrome endpoint identity for a worker
    #[must_use]
    pub fn endpoint_for(&self, worker_id: usize) -> BrowserEndpoint {
        let chrome = &self.settings.chrome;
        BrowserEndpoint {
            debug_port: chrome.base_port.wrapping_add(worker_id as u16),
            profile: format!("{}{:02}", chrome.profile_prefix, worker_id),
        }
    }

    /// Drop a worker's pool (closing it), or all pools when `worker_id` is
    /// None. Test support, mirroring per-worker resets.
    pub fn reset(&self, worker_id: Option<usize>) {
        let mut pools = self.pools.lock();
        match worker_id {
            Some(id) => {
                if let Some(pool) = pools.remove(&id) {
                    drop(pool.close());
                }
            }
            None => {
                for (_, pool) in pools.drain() {
                    drop(pool.close());
                }
            }
        }
    }

    /// Stats for all live pools, keyed by worker id
    #[must_use]
    pub fn stats(&self) -> HashMap<usize, TabPoolStats> {
        self.pools
            .lock()
            .iter()
            .map(|(id, pool)| (*id, pool.stats()))
            .collect()
    }
}

/// Per-SERP-engine rate limiter.
///
/// Enforces an engine's minimum interval between requests and a semaphore
/// bound on concurrency, isolated by engine name. Used alongside the tab
/// pool for fine-grained control.
pub struct EngineRateLimiter {
    engines: dashmap::DashMap<String, Arc<EngineState>>,
    settings: Arc<Settings>,
}

struct EngineState {
    semaphore: Arc<tokio::sync::Semaphore>,
    min_interval: Duration,
    last_request: tokio::sync::Mutex<Option<Instant>>,
}

/// Held for the duration of one engine request; dropping it releases the
/// concurrency slot.
pub struct EnginePermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl EngineRateLimiter {
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            engines: dashmap::DashMap::new(),
            settings,
        }
    }

    fn engine(&self, engine: &str) -> Arc<EngineState> {
        if let Some(state) = self.engines.get(engine) {
            return Arc::clone(state.value());
        }
        let config = self.settings.serp_engine(engine);
        let state = Arc::new(EngineState {
            semaphore: Arc::new(tokio::sync::Semaphore::new(config.concurrency.max(1))),
            min_interval: Duration::from_secs_f64(config.min_interval.max(0.0)),
            last_request: tokio::sync::Mutex::new(None),
        });
        debug!(engine, concurrency = config.concurrency, "Initialized rate limiter for engine");
        self.engines
            .entry(engine.to_string())
            .or_insert(state)
            .value()
            .clone()
    }

    /// Acquire a slot for an engine, enforcing both concurrency and the
    /// minimum interval since the engine's last request.
    pub async fn acquire(&self, engine: &str) -> CoreResult<EnginePermit> {
        let state = self.engine(engine);
        let permit = Arc::clone(&state.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Other(format!("engine limiter closed: {engine}")))?;

        let mut last = state.last_request.lock().await;
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < state.min_interval {
                let wait = state.min_interval - since;
                debug!(engine, wait_ms = wait.as_millis() as u64, "Engine rate limiting: waiting");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());

        Ok(EnginePermit { _permit: permit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestPool = TabPool<u32>;

    fn pool(max_tabs: usize) -> TestPool {
        TabPool::new(max_tabs, Duration::from_millis(300), 1)
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses_tabs() {
        let p = pool(1);
        let tab = p.acquire(|| async { Ok(7u32) }).await.expect("create tab");
        p.release(tab);

        // Second acquire must reuse, not create
        let tab = p
            .acquire(|| async { panic!("should reuse the released tab") })
            .await
            .expect("reuse tab");
        assert_eq!(tab, 7);
        assert_eq!(p.stats().total_tabs, 1);
        p.release(tab);
    }

    #[tokio::test]
    async fn effective_max_tabs_only_decreases_until_reset() {
        let p = pool(3);
        p.report_captcha();
        assert_eq!(p.backoff_state().effective_max_tabs, 2);
        p.report_403();
        assert_eq!(p.backoff_state().effective_max_tabs, 1);

        // Floor: further events keep the limit at 1 and keep counting
        p.report_captcha();
        p.report_403();
        let state = p.backoff_state();
        assert_eq!(state.effective_max_tabs, 1);
        assert!(state.backoff_active);
        assert_eq!(state.captcha_count, 2);
        assert_eq!(state.error_403_count, 2);

        p.reset_backoff();
        let state = p.backoff_state();
        assert_eq!(state.effective_max_tabs, 3);
        assert!(!state.backoff_active);
        assert_eq!(state.captcha_count, 0);
    }

    #[tokio::test]
    async fn acquire_times_out_at_effective_limit() {
        let p = pool(2);
        p.report_captcha(); // effective limit now 1

        let first = p.acquire(|| async { Ok(1u32) }).await.expect("first tab");
        let err = p
            .acquire(|| async { Ok(2u32) })
            .await
            .expect_err("second acquire must block and time out");
        assert!(matches!(err, CoreError::TabAcquireTimeout { .. }));
        p.release(first);
    }

    #[tokio::test]
    async fn registry_isolates_workers() {
        let registry: TabPoolRegistry<u32> = TabPoolRegistry::new(Arc::new(Settings::default()));
        let pool0 = registry.get(0);
        let pool1 = registry.get(1);

        assert!(!Arc::ptr_eq(&pool0, &pool1));
        assert_eq!(pool0.max_tabs(), 1);
        assert_eq!(pool1.max_tabs(), 1);

        // Same worker id returns the singleton
        assert!(Arc::ptr_eq(&pool0, &registry.get(0)));

        // One worker's backoff never touches the other pool
        pool0.report_captcha();
        assert!(pool0.backoff_state().backoff_active);
        assert!(!pool1.backoff_state().backoff_active);
    }

    #[tokio::test]
    async fn endpoints_are_worker_scoped() {
        let registry: TabPoolRegistry<u32> = TabPoolRegistry::new(Arc::new(Settings::default()));
        let e0 = registry.endpoint_for(0);
        let e1 = registry.endpoint_for(1);
        assert_eq!(e1.debug_port, e0.debug_port + 1);
        assert_ne!(e0.profile, e1.profile);
        assert!(e0.profile.ends_with("00"));
        assert!(e1.profile.ends_with("01"));
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let p = pool(1);
        drop(p.close());
        let err = p
            .acquire(|| async { Ok(1u32) })
            .await
            .expect_err("closed pool");
        assert!(matches!(err, CoreError::TabPoolClosed));
    }
}
