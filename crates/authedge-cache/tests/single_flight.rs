//! Thundering-herd protection across the coalescer and the token cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use authedge_cache::{
    AdaptiveTtlConfig, AdaptiveTtlController, Coalescer, TokenCache, TokenCacheConfig,
};
use authedge_core::{AuthorityError, UserContext};
use time::OffsetDateTime;
use tokio::sync::Barrier;

const CALLERS: usize = 100;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_callers_share_one_invocation() {
    let coalescer: Arc<Coalescer<u64, String>> = Arc::new(Coalescer::default());
    let invocations = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let coalescer = coalescer.clone();
            let invocations = invocations.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                coalescer
                    .coalesce("perm:t1:u1:/api/orders/1:DELETE", move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(0xfeed)
                    })
                    .await
            })
        })
        .collect();

    let results = futures_util::future::join_all(handles).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap(), Ok(0xfeed));
    }

    let stats = coalescer.stats();
    assert_eq!(stats.leaders, 1);
    assert_eq!(stats.followers, (CALLERS - 1) as u64);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_token_misses_load_once() {
    let cache = TokenCache::new(
        TokenCacheConfig::default(),
        Arc::new(AdaptiveTtlController::new(AdaptiveTtlConfig::default())),
        Arc::new(Coalescer::default()),
    );
    let loads = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let cache = cache.clone();
            let loads = loads.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                cache
                    .get_or_load("eyJhbGciOiJIUzI1NiJ9.shared", move || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, AuthorityError>(UserContext::new(
                            "u1",
                            "t1",
                            OffsetDateTime::now_utc() + time::Duration::hours(1),
                        ))
                    })
                    .await
            })
        })
        .collect();

    let results = futures_util::future::join_all(handles).await;
    let contexts: Vec<_> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(contexts.iter().all(|ctx| Arc::ptr_eq(ctx, &contexts[0])));
    assert!(cache.get("eyJhbGciOiJIUzI1NiJ9.shared").is_some());
}
