//! Adaptive rate limiter for academic API providers
//!
//! Enforces per-provider QPS (minimum request interval) and concurrency
//! (max parallel in-flight requests) limits. A 429 from a provider shrinks
//! the effective parallelism; after a stable period without 429s the limit
//! recovers one step at a time, checked lazily on each acquire.
//!
//! Instance-based: each limiter owns its provider registry, so tests run
//! against isolated instances.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{AcademicApiBackoffConfig, AcademicApiProviderConfig, Settings};
use crate::error::{CoreError, CoreResult};

/// Interval between slot-availability checks while blocked on acquire.
///
/// The poll exists to combine event-wait with adaptive-limit changes: a
/// recovery that raises the effective limit frees a slot without any
/// release() firing the event.
const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Adaptive backoff state for one provider
#[derive(Debug, Clone)]
pub struct BackoffState {
    /// Current effective limit (may be below the configured cap)
    pub effective_max_parallel: usize,
    /// Configured upper bound
    pub config_max_parallel: usize,
    /// When the provider last answered 429
    pub last_429: Option<Instant>,
    /// When recovery was last attempted
    pub last_recovery_attempt: Option<Instant>,
    pub backoff_active: bool,
    pub consecutive_429_count: u32,
}

impl BackoffState {
    fn new(max_parallel: usize) -> Self {
        Self {
            effective_max_parallel: max_parallel,
            config_max_parallel: max_parallel,
            last_429: None,
            last_recovery_attempt: None,
            backoff_active: false,
            consecutive_429_count: 0,
        }
    }
}

/// Snapshot of a provider's limiter state, for logging and tests
#[derive(Debug, Clone)]
pub struct ProviderStats {
    pub min_interval_seconds: f64,
    pub max_parallel: usize,
    pub active_count: usize,
    pub effective_max_parallel: usize,
    pub backoff_active: bool,
    pub consecutive_429_count: u32,
}

/// Per-provider runtime state
struct ProviderState {
    config: AcademicApiProviderConfig,
    /// Active request count and backoff, mutated together
    runtime: parking_lot::Mutex<ProviderRuntime>,
    /// Last request timestamp, guarded separately for QPS enforcement
    qps: tokio::sync::Mutex<Option<Instant>>,
    /// Fired when a slot may have become available
    slot_available: Notify,
}

struct ProviderRuntime {
    active_count: usize,
    backoff: BackoffState,
}

/// Global rate limiter for academic APIs.
///
/// ```ignore
/// limiter.acquire("semantic_scholar", Duration::from_secs(60)).await?;
/// let outcome = api_call().await;
/// match outcome {
///     Ok(_) => limiter.report_success("semantic_scholar"),
///     Err(RateLimited) => limiter.report_429("semantic_scholar"),
///     Err(_) => {}
/// }
/// limiter.release("semantic_scholar");
/// ```
pub struct AcademicApiRateLimiter {
    providers: DashMap<String, Arc<ProviderState>>,
    settings: Arc<Settings>,
    backoff_config: AcademicApiBackoffConfig,
}

impl AcademicApiRateLimiter {
    #[must_use]
    pub fn new(settings: Arc<Settings>) -> Self {
        let backoff_config = settings.concurrency.backoff.academic_api.clone();
        Self {
            providers: DashMap::new(),
            settings,
            backoff_config,
        }
    }

    /// Provider state, initialized from config on first use and cached
    fn provider(&self, provider: &str) -> Arc<ProviderState> {
        if let Some(state) = self.providers.get(provider) {
            return Arc::clone(state.value());
        }
        let config = self.settings.academic_api(provider);
        let state = Arc::new(ProviderState {
            runtime: parking_lot::Mutex::new(ProviderRuntime {
                active_count: 0,
                backoff: BackoffState::new(config.max_parallel.max(1)),
            }),
            qps: tokio::sync::Mutex::new(None),
            slot_available: Notify::new(),
            config,
        });
        debug!(
            provider,
            max_parallel = state.config.max_parallel,
            min_interval = state.config.min_interval_seconds,
            "Initialized rate limiter for provider"
        );
        self.providers
            .entry(provider.to_string())
            .or_insert(state)
            .value()
            .clone()
    }

    /// Acquire a rate limit slot for a provider.
    ///
    /// Blocks until both a concurrency slot is available under the
    /// provider's effective max-parallel and the minimum interval since the
    /// provider's last request has elapsed. Exceeding `timeout` while
    /// waiting for a slot returns an error; the caller degrades its current
    /// unit of work, not the pool.
    pub async fn acquire(&self, provider: &str, timeout: Duration) -> CoreResult<()> {
        let state = self.provider(provider);

        // Lazy recovery check before competing for a slot
        self.maybe_recover(provider, &state);

        let start = Instant::now();
        loop {
            {
                let mut runtime = state.runtime.lock();
                if runtime.active_count < runtime.backoff.effective_max_parallel {
                    runtime.active_count += 1;
                    break;
                }
                debug!(
                    provider,
                    active = runtime.active_count,
                    effective_max = runtime.backoff.effective_max_parallel,
                    "Backoff limiting: waiting for slot"
                );
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                let effective_max = state.runtime.lock().backoff.effective_max_parallel;
                return Err(CoreError::RateLimitAcquireTimeout {
                    provider: provider.to_string(),
                    timeout_secs: timeout.as_secs(),
                    effective_max,
                });
            }

            let wait = SLOT_POLL_INTERVAL.min(timeout - elapsed);
            // Timeout expiry here just means another poll round.
            let _ = tokio::time::timeout(wait, state.slot_available.notified()).await;
        }

        // QPS enforcement: one request per min_interval per provider
        let min_interval = Duration::from_secs_f64(state.config.min_interval_seconds.max(0.0));
        let mut last = state.qps.lock().await;
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < min_interval {
                let wait = min_interval - since;
                debug!(provider, wait_ms = wait.as_millis() as u64, "Rate limiting: waiting");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());

        Ok(())
    }

    /// Release a slot. Call after `acquire` completes, on every path.
    pub fn release(&self, provider: &str) {
        let Some(state) = self.providers.get(provider).map(|s| Arc::clone(s.value())) else {
            return;
        };
        {
            let mut runtime = state.runtime.lock();
            if runtime.active_count > 0 {
                runtime.active_count -= 1;
            }
        }
        state.slot_available.notify_waiters();
    }

    /// Report a 429 from a provider: reduce effective parallelism by the
    /// configured step, floored at 1. At the floor the limit stays at 1 but
    /// backoff remains active and the counter still increments.
    pub fn report_429(&self, provider: &str) {
        let state = self.provider(provider);
        let step = self.backoff_config.decrease_step.max(1);
        let mut runtime = state.runtime.lock();
        let backoff = &mut runtime.backoff;

        let new_max = backoff.effective_max_parallel.saturating_sub(step).max(1);
        backoff.last_429 = Some(Instant::now());
        backoff.backoff_active = true;
        backoff.consecutive_429_count += 1;

        if new_max < backoff.effective_max_parallel {
            backoff.effective_max_parallel = new_max;
            warn!(
                provider,
                new_effective_max = new_max,
                config_max = backoff.config_max_parallel,
                consecutive_429_count = backoff.consecutive_429_count,
                "Backoff triggered: reducing effective_max_parallel"
            );
        } else {
            warn!(
                provider,
                effective_max_parallel = backoff.effective_max_parallel,
                consecutive_429_count = backoff.consecutive_429_count,
                "Provider at floor: 429s continuing at minimum concurrency"
            );
        }
    }

    /// Report a successful request: resets the consecutive-429 count. Does
    /// not itself restore the limit; recovery happens lazily on acquire.
    pub fn report_success(&self, provider: &str) {
        let state = self.provider(provider);
        state.runtime.lock().backoff.consecutive_429_count = 0;
    }

    /// Attempt recovery if the stable period has passed since both the last
    /// 429 and the last recovery attempt.
    fn maybe_recover(&self, provider: &str, state: &ProviderState) {
        let stable = Duration::from_secs(self.backoff_config.recovery_stable_seconds);
        let mut runtime = state.runtime.lock();
        let backoff = &mut runtime.backoff;
        if !backoff.backoff_active {
            return;
        }

        let stable_since_429 = backoff.last_429.map_or(true, |t| t.elapsed() >= stable);
        let stable_since_attempt = backoff
            .last_recovery_attempt
            .map_or(true, |t| t.elapsed() >= stable);
        if !(stable_since_429 && stable_since_attempt) {
            return;
        }

        backoff.last_recovery_attempt = Some(Instant::now());
        if backoff.effective_max_parallel < backoff.config_max_parallel {
            backoff.effective_max_parallel += 1;
            info!(
                provider,
                new_effective_max = backoff.effective_max_parallel,
                config_max = backoff.config_max_parallel,
                "Backoff recovery: increasing effective_max_parallel"
            );
            state.slot_available.notify_waiters();
        }
        if backoff.effective_max_parallel >= backoff.config_max_parallel {
            backoff.backoff_active = false;
            info!(
                provider,
                effective_max = backoff.effective_max_parallel,
                "Backoff fully recovered"
            );
        }
    }

    /// Limiter statistics for a provider
    #[must_use]
    pub fn stats(&self, provider: &str) -> ProviderStats {
        let state = self.provider(provider);
        let runtime = state.runtime.lock();
        ProviderStats {
            min_interval_seconds: state.config.min_interval_seconds,
            max_parallel: state.config.max_parallel,
            active_count: runtime.active_count,
            effective_max_parallel: runtime.backoff.effective_max_parallel,
            backoff_active: runtime.backoff.backoff_active,
            consecutive_429_count: runtime.backoff.consecutive_429_count,
        }
    }

    /// Move a provider's last-429 timestamp into the past.
    ///
    /// Test support: lets recovery-eligibility tests advance the stable
    /// window without sleeping through it.
    #[doc(hidden)]
    pub fn backdate_last_429(&self, provider: &str, by: Duration) {
        let state = self.provider(provider);
        let mut runtime = state.runtime.lock();
        if let Some(t) = runtime.backoff.last_429 {
            runtime.backoff.last_429 = t.checked_sub(by);
        }
        if let Some(t) = runtime.backoff.last_recovery_attempt {
            runtime.backoff.last_recovery_attempt = t.checked_sub(by);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn limiter_with(max_parallel: usize, recovery_stable_seconds: u64) -> AcademicApiRateLimiter {
        let mut settings = Settings::default();
        settings.academic_apis.insert(
            "test".to_string(),
            AcademicApiProviderConfig {
                base_url: "https://api.test.example".to_string(),
                min_interval_seconds: 0.0,
                max_parallel,
                profile: None,
            },
        );
        settings.concurrency.backoff.academic_api.recovery_stable_seconds = recovery_stable_seconds;
        AcademicApiRateLimiter::new(Arc::new(settings))
    }

    #[tokio::test]
    async fn report_429_decrements_effective_parallelism() {
        let limiter = limiter_with(3, 60);
        let before = limiter.stats("test");
        assert_eq!(before.effective_max_parallel, 3);
        assert!(!before.backoff_active);

        limiter.report_429("test");

        let after = limiter.stats("test");
        assert_eq!(after.effective_max_parallel, 2);
        assert!(after.backoff_active);
        assert_eq!(after.consecutive_429_count, 1);
    }

    #[tokio::test]
    async fn effective_parallelism_never_drops_below_one() {
        let limiter = limiter_with(2, 60);
        for _ in 0..10 {
            limiter.report_429("test");
        }
        let stats = limiter.stats("test");
        assert_eq!(stats.effective_max_parallel, 1);
        assert!(stats.backoff_active);
        assert_eq!(stats.consecutive_429_count, 10);
    }

    #[tokio::test]
    async fn acquire_recovers_after_stable_period() {
        let limiter = limiter_with(3, 60);
        limiter.report_429("test");
        assert_eq!(limiter.stats("test").effective_max_parallel, 2);

        // Stable window elapsed: 120s since the last 429
        limiter.backdate_last_429("test", Duration::from_secs(120));

        limiter
            .acquire("test", Duration::from_secs(5))
            .await
            .expect("acquire should succeed");
        limiter.release("test");

        let stats = limiter.stats("test");
        assert_eq!(stats.effective_max_parallel, 3);
        assert!(!stats.backoff_active);
    }

    #[tokio::test]
    async fn report_success_resets_consecutive_count_only() {
        let limiter = limiter_with(3, 60);
        limiter.report_429("test");
        limiter.report_success("test");

        let stats = limiter.stats("test");
        assert_eq!(stats.consecutive_429_count, 0);
        // The limit itself is untouched until recovery runs.
        assert_eq!(stats.effective_max_parallel, 2);
        assert!(stats.backoff_active);
    }

    #[tokio::test]
    async fn acquire_times_out_when_slots_exhausted() {
        let limiter = limiter_with(1, 60);
        limiter
            .acquire("test", Duration::from_secs(1))
            .await
            .expect("first acquire");

        let err = limiter
            .acquire("test", Duration::from_millis(250))
            .await
            .expect_err("second acquire must time out");
        assert!(matches!(err, CoreError::RateLimitAcquireTimeout { .. }));

        limiter.release("test");
    }
}
