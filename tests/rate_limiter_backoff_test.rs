//! Academic API rate limiter: 429 backoff and lazy recovery

use std::sync::Arc;
use std::time::Duration;

use scout_core::config::AcademicApiProviderConfig;
use scout_core::{AcademicApiRateLimiter, Settings};

fn limiter(max_parallel: usize, recovery_stable_seconds: u64) -> AcademicApiRateLimiter {
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
    settings
        .concurrency
        .backoff
        .academic_api
        .recovery_stable_seconds = recovery_stable_seconds;
    AcademicApiRateLimiter::new(Arc::new(settings))
}

#[tokio::test]
async fn report_429_steps_down_and_sets_backoff() {
    let limiter = limiter(3, 60);
    let before = limiter.stats("test");
    assert_eq!(before.effective_max_parallel, 3);
    assert!(!before.backoff_active);
    assert_eq!(before.consecutive_429_count, 0);

    limiter.report_429("test");

    let after = limiter.stats("test");
    assert_eq!(after.effective_max_parallel, 2);
    assert!(after.backoff_active);
    assert_eq!(after.consecutive_429_count, 1);
}

#[tokio::test]
async fn floor_is_one_no_matter_how_many_429s() {
    let limiter = limiter(2, 60);
    for _ in 0..25 {
        limiter.report_429("test");
    }
    let stats = limiter.stats("test");
    assert_eq!(stats.effective_max_parallel, 1);
    assert!(stats.backoff_active);
    // No silent masking at the floor: the counter keeps going
    assert_eq!(stats.consecutive_429_count, 25);
}

#[tokio::test]
async fn stable_period_recovers_one_step_on_acquire() {
    let limiter = limiter(3, 60);
    limiter.report_429("test");
    assert_eq!(limiter.stats("test").effective_max_parallel, 2);

    // 120 seconds of stability on a 60-second recovery window
    limiter.backdate_last_429("test", Duration::from_secs(120));

    limiter
        .acquire("test", Duration::from_secs(5))
        .await
        .expect("acquire");
    limiter.release("test");

    let stats = limiter.stats("test");
    assert_eq!(stats.effective_max_parallel, 3);
    assert!(!stats.backoff_active);
}

#[tokio::test]
async fn recovery_waits_for_the_stable_window() {
    let limiter = limiter(3, 3600);
    limiter.report_429("test");

    // Immediately acquiring must not recover: the 429 just happened
    limiter
        .acquire("test", Duration::from_secs(5))
        .await
        .expect("acquire");
    limiter.release("test");

    let stats = limiter.stats("test");
    assert_eq!(stats.effective_max_parallel, 2);
    assert!(stats.backoff_active);
}

#[tokio::test]
async fn concurrency_slots_respect_effective_limit() {
    let limiter = Arc::new(limiter(2, 60));
    limiter.report_429("test"); // effective limit now 1

    limiter
        .acquire("test", Duration::from_secs(1))
        .await
        .expect("first slot");

    let err = limiter
        .acquire("test", Duration::from_millis(300))
        .await
        .expect_err("second slot must be unavailable");
    assert!(err.to_string().contains("rate limit slot"));

    limiter.release("test");

    // Released slot is acquirable again
    limiter
        .acquire("test", Duration::from_secs(1))
        .await
        .expect("slot after release");
    limiter.release("test");
}

#[tokio::test]
async fn min_interval_spaces_requests() {
    let mut settings = Settings::default();
    settings.academic_apis.insert(
        "spaced".to_string(),
        AcademicApiProviderConfig {
            base_url: "https://api.spaced.example".to_string(),
            min_interval_seconds: 0.2,
            max_parallel: 4,
            profile: None,
        },
    );
    let limiter = AcademicApiRateLimiter::new(Arc::new(settings));

    let started = std::time::Instant::now();
    limiter
        .acquire("spaced", Duration::from_secs(5))
        .await
        .expect("first");
    limiter.release("spaced");
    limiter
        .acquire("spaced", Duration::from_secs(5))
        .await
        .expect("second");
    limiter.release("spaced");

    assert!(started.elapsed() >= Duration::from_millis(180));
}
