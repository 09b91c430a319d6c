use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::test;

use super::*;

fn test_config() -> CacheConfig {
    CacheConfig {
        default_ttl: Duration::from_secs(60),
        sweep_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

fn slashings_key() -> CacheKey {
    CacheKey::builder("slashings")
        .segment(1)
        .segment(50)
        .segment(0)
        .segment(0)
        .segment(0)
        .segment(0)
        .segment("")
        .segment("")
        .segment("")
        .segment(0)
        .segment(1)
        .build()
}

/// This test asserts that N concurrent callers of one cold key trigger exactly one
/// builder run, and that all of them receive the same payload.
#[tokio::test(flavor = "multi_thread")]
async fn test_stampede_prevention() {
    test::setup();

    let cache = PageCache::new(test_config());
    let computations = Arc::new(AtomicUsize::new(0));
    let key = slashings_key();
    assert_eq!(key.as_str(), "slashings:1:50:0:0:0:0::::0:1");

    let calls: Vec<_> = (0..10)
        .map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            let computations = computations.clone();
            tokio::spawn(async move {
                cache
                    .compute(key, move || async move {
                        computations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok("slashings page".to_owned())
                    })
                    .await
            })
        })
        .collect();

    for call in calls {
        let payload: Arc<String> = call.await.unwrap().unwrap();
        assert_eq!(payload.as_str(), "slashings page");
    }

    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ttl_expiry_triggers_rebuild() {
    test::setup();

    let config = CacheConfig {
        default_ttl: Duration::from_millis(50),
        ..Default::default()
    };
    let cache = PageCache::new(config);
    let computations = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::builder("epoch").segment(1337).build();

    let build = |computations: &Arc<AtomicUsize>| {
        let computations = Arc::clone(computations);
        move || async move {
            computations.fetch_add(1, Ordering::SeqCst);
            Ok(42u64)
        }
    };

    let first = cache.compute(key.clone(), build(&computations)).await.unwrap();
    assert_eq!(*first, 42);

    // Within the ttl the stored payload is served without a builder run.
    let second = cache.compute(key.clone(), build(&computations)).await.unwrap();
    assert_eq!(*second, 42);
    assert_eq!(computations.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Past the deadline the entry counts as a miss and is rebuilt.
    let third = cache.compute(key, build(&computations)).await.unwrap();
    assert_eq!(*third, 42);
    assert_eq!(computations.load(Ordering::SeqCst), 2);
}

/// This test asserts that a build failure reaches every coalesced caller, and that the
/// key is released rather than stuck on the failure.
#[tokio::test(flavor = "multi_thread")]
async fn test_build_failure_releases_key() {
    test::setup();

    let cache = PageCache::new(test_config());
    let key = CacheKey::builder("validators").segment("activity").build();

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .compute::<u64, _, _>(key, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(CacheError::build_failed("db has gone away"))
                    })
                    .await
            })
        })
        .collect();

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, CacheError::BuildFailed("db has gone away".into()));
    }

    // Nothing was stored for the failed build.
    assert_eq!(cache.entry_count(), 0);

    // The next call starts a fresh build and succeeds.
    let result = cache.compute(key, || async { Ok(7u64) }).await.unwrap();
    assert_eq!(*result, 7);
}

#[tokio::test]
async fn test_bypass_still_publishes() {
    test::setup();

    let cache = PageCache::new(test_config());
    let computations = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::builder("slots").segment("filtered").build();

    let bypass = ComputeOptions {
        use_cache: false,
        ..Default::default()
    };

    let fresh = {
        let computations = computations.clone();
        cache
            .compute_memoized(key.clone(), bypass, move || async move {
                computations.fetch_add(1, Ordering::SeqCst);
                Ok("fresh".to_owned())
            })
            .await
            .unwrap()
    };
    assert_eq!(fresh.as_str(), "fresh");

    // The bypassing call stored its result for everyone else.
    let cached = {
        let computations = computations.clone();
        cache
            .compute(key.clone(), move || async move {
                computations.fetch_add(1, Ordering::SeqCst);
                Ok("rebuilt".to_owned())
            })
            .await
            .unwrap()
    };
    assert_eq!(cached.as_str(), "fresh");
    assert_eq!(computations.load(Ordering::SeqCst), 1);

    // A second bypassing call rebuilds even though a valid entry exists.
    let rebuilt = {
        let computations = computations.clone();
        cache
            .compute_memoized(key, bypass, move || async move {
                computations.fetch_add(1, Ordering::SeqCst);
                Ok("rebuilt".to_owned())
            })
            .await
            .unwrap()
    };
    assert_eq!(rebuilt.as_str(), "rebuilt");
    assert_eq!(computations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_capacity_eviction_is_lru() {
    test::setup();

    let config = CacheConfig {
        max_entries: Some(2),
        ..test_config()
    };
    let cache = PageCache::new(config);

    for name in ["a", "b", "c"] {
        let key = CacheKey::builder(name).build();
        cache
            .compute(key, move || async move { Ok(name.to_owned()) })
            .await
            .unwrap();
        // Give every entry a distinct recency timestamp.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(cache.entry_count(), 3);

    // Serve "a" again so that "b" is the least recently used entry.
    cache
        .compute(CacheKey::builder("a").build(), || async {
            Ok("unused".to_owned())
        })
        .await
        .unwrap();

    cache.sweep(Instant::now());

    assert_eq!(cache.entry_count(), 2);
    assert!(cache.contains_key(&CacheKey::builder("a").build()));
    assert!(!cache.contains_key(&CacheKey::builder("b").build()));
    assert!(cache.contains_key(&CacheKey::builder("c").build()));

    cache.clear();
    assert_eq!(cache.entry_count(), 0);
}

/// This test asserts that the sweep never touches a build that is still in flight, and
/// that capacity pressure is resolved against ready entries only.
#[tokio::test(flavor = "multi_thread")]
async fn test_sweep_ignores_inflight_builds() {
    test::setup();

    let config = CacheConfig {
        max_entries: Some(1),
        ..test_config()
    };
    let cache = PageCache::new(config);

    let ready = CacheKey::builder("ready").build();
    cache
        .compute(ready.clone(), || async { Ok("ready".to_owned()) })
        .await
        .unwrap();

    let building = CacheKey::builder("building").build();
    let slow = {
        let cache = cache.clone();
        let key = building.clone();
        tokio::spawn(async move {
            cache
                .compute(key, || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok("built".to_owned())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The sweep sees one ready entry and one in-flight build; the build is untouchable
    // and the ready entry is within capacity.
    cache.sweep(Instant::now());
    assert_eq!(cache.entry_count(), 1);
    assert!(cache.contains_key(&ready));

    let built = slow.await.unwrap().unwrap();
    assert_eq!(built.as_str(), "built");
    assert!(cache.contains_key(&building));

    // Once the build has landed, the next sweep evicts down to capacity, dropping the
    // older entry first.
    cache.sweep(Instant::now());
    assert_eq!(cache.entry_count(), 1);
    assert!(cache.contains_key(&building));
    assert!(!cache.contains_key(&ready));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_timeout_leaves_build_running() {
    test::setup();

    let cache = PageCache::new(test_config());
    let computations = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::builder("deposits").build();

    let owner = {
        let cache = cache.clone();
        let key = key.clone();
        let computations = computations.clone();
        tokio::spawn(async move {
            cache
                .compute(key, move || async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok("done".to_owned())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A follower with a bounded wait gives up without disturbing the build.
    let options = ComputeOptions {
        wait_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let err = cache
        .compute_memoized::<String, _, _>(key.clone(), options, || async {
            Ok("unused".to_owned())
        })
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::WaitTimeout(Duration::from_millis(50)));

    // The owning build ran to completion regardless…
    assert_eq!(owner.await.unwrap().unwrap().as_str(), "done");

    // …and its result is now served from the store.
    let cached = cache
        .compute(key, || async { Ok("unused".to_owned()) })
        .await
        .unwrap();
    assert_eq!(cached.as_str(), "done");
    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_builder_panic_is_contained() {
    test::setup();

    let cache = PageCache::new(test_config());
    let key = CacheKey::builder("forks").build();

    let err = cache
        .compute::<String, _, _>(key.clone(), || async { panic!("template exploded") })
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CacheError::BuildFailed("page builder panicked: template exploded".into())
    );

    // A panicking builder releases the key like any other failure.
    let result = cache
        .compute(key, || async { Ok("recovered".to_owned()) })
        .await
        .unwrap();
    assert_eq!(result.as_str(), "recovered");
}

#[tokio::test]
async fn test_payload_type_mismatch() {
    test::setup();

    let cache = PageCache::new(test_config());
    let key = CacheKey::builder("overview").build();

    let stored = cache.compute(key.clone(), || async { Ok(123u64) }).await.unwrap();
    assert_eq!(*stored, 123);

    // Requesting the same key as a different page model is a programming error and is
    // reported distinctly from a build failure.
    let err = cache
        .compute::<String, _, _>(key, || async { Ok("wrong shape".to_owned()) })
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::TypeMismatch);
}

#[tokio::test]
async fn test_disabled_cache_still_coalesces() {
    test::setup();

    let config = CacheConfig {
        enabled: false,
        ..test_config()
    };
    let cache = PageCache::new(config);
    let computations = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::builder("epochs").segment(25).build();

    let build = |computations: &Arc<AtomicUsize>| {
        let computations = Arc::clone(computations);
        move || async move {
            computations.fetch_add(1, Ordering::SeqCst);
            Ok(1u8)
        }
    };

    cache.compute(key.clone(), build(&computations)).await.unwrap();
    cache.compute(key.clone(), build(&computations)).await.unwrap();

    // Nothing is stored and every sequential call rebuilds.
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(computations.load(Ordering::SeqCst), 2);

    // Concurrent calls still coalesce onto one build.
    let calls: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            let computations = computations.clone();
            tokio::spawn(async move {
                cache
                    .compute(key, move || async move {
                        computations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(1u8)
                    })
                    .await
            })
        })
        .collect();
    for call in calls {
        assert_eq!(*call.await.unwrap().unwrap(), 1);
    }
    assert_eq!(computations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_maintenance_loop_sweeps_expired_entries() {
    test::setup();

    let config = CacheConfig {
        default_ttl: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let cache = PageCache::new(config);
    let maintenance = cache.spawn_maintenance();

    cache
        .compute(CacheKey::builder("epochs").build(), || async { Ok(1u8) })
        .await
        .unwrap();
    assert_eq!(cache.entry_count(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.entry_count(), 0);

    maintenance.stop().await;
}
