//! Tab pool worker isolation and manual-only backoff recovery

use std::sync::Arc;
use std::time::Duration;

use scout_core::search::tab_pool::TabPoolRegistry;
use scout_core::{Settings, TabPool};

fn settings_with_max_tabs(max_tabs: usize) -> Arc<Settings> {
    let mut settings = Settings::default();
    settings.concurrency.browser_serp.max_tabs = max_tabs;
    Arc::new(settings)
}

#[tokio::test]
async fn workers_get_isolated_pools_with_default_limit() {
    let registry: TabPoolRegistry<u32> = TabPoolRegistry::new(Arc::new(Settings::default()));

    let pool0 = registry.get(0);
    let pool1 = registry.get(1);

    assert!(!Arc::ptr_eq(&pool0, &pool1));
    assert_eq!(pool0.max_tabs(), 1);
    assert_eq!(pool1.max_tabs(), 1);
    assert!(Arc::ptr_eq(&pool0, &registry.get(0)));
}

#[tokio::test]
async fn chrome_endpoints_follow_worker_identity() {
    let registry: TabPoolRegistry<u32> = TabPoolRegistry::new(Arc::new(Settings::default()));
    let e0 = registry.endpoint_for(0);
    let e3 = registry.endpoint_for(3);
    assert_eq!(e3.debug_port, e0.debug_port + 3);
    assert!(e0.profile.ends_with("00"));
    assert!(e3.profile.ends_with("03"));
}

#[tokio::test]
async fn backoff_never_recovers_without_manual_reset() {
    let registry: TabPoolRegistry<u32> = TabPoolRegistry::new(settings_with_max_tabs(3));
    let pool = registry.get(0);

    pool.report_captcha();
    pool.report_403();
    assert_eq!(pool.backoff_state().effective_max_tabs, 1);

    // Time passing changes nothing: no auto-recovery for browser pools
    tokio::time::sleep(Duration::from_millis(200)).await;
    let tab = pool.acquire(|| async { Ok(1u32) }).await.expect("tab");
    pool.release(tab);
    let state = pool.backoff_state();
    assert_eq!(state.effective_max_tabs, 1);
    assert!(state.backoff_active);

    // Further signals at the floor keep counting
    pool.report_captcha();
    pool.report_403();
    let state = pool.backoff_state();
    assert_eq!(state.effective_max_tabs, 1);
    assert_eq!(state.captcha_count, 2);
    assert_eq!(state.error_403_count, 2);

    pool.reset_backoff();
    let state = pool.backoff_state();
    assert_eq!(state.effective_max_tabs, 3);
    assert!(!state.backoff_active);
    assert_eq!(state.captcha_count, 0);
    assert_eq!(state.error_403_count, 0);
}

#[tokio::test]
async fn one_workers_backoff_does_not_starve_another() {
    let registry: TabPoolRegistry<u32> = TabPoolRegistry::new(settings_with_max_tabs(2));
    let pool0 = registry.get(0);
    let pool1 = registry.get(1);

    pool0.report_captcha();
    assert_eq!(pool0.backoff_state().effective_max_tabs, 1);
    assert_eq!(pool1.backoff_state().effective_max_tabs, 2);

    // Worker 1 can still open both of its tabs
    let a = pool1.acquire(|| async { Ok(10u32) }).await.expect("tab a");
    let b = pool1.acquire(|| async { Ok(11u32) }).await.expect("tab b");
    pool1.release(a);
    pool1.release(b);
}

#[tokio::test]
async fn released_tabs_are_reused_in_fifo_order() {
    let pool: TabPool<u32> = TabPool::new(2, Duration::from_secs(1), 1);
    let a = pool.acquire(|| async { Ok(1u32) }).await.expect("a");
    let b = pool.acquire(|| async { Ok(2u32) }).await.expect("b");
    pool.release(a);
    pool.release(b);

    let first = pool
        .acquire(|| async { panic!("must reuse") })
        .await
        .expect("reuse");
    assert_eq!(first, 1);
    pool.release(first);
    assert_eq!(pool.stats().total_tabs, 2);
}
