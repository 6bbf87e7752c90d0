//! Runs against a live Redis only when `FLOODCONTROL_TEST_REDIS_URL` is set,
//! e.g. `FLOODCONTROL_TEST_REDIS_URL=redis://127.0.0.1:6379/15 cargo test`.

use flood_control::config::{FloodControlConfig, StoreBackend, StoreConfig};
use flood_control::retry::RetryPolicy;
use flood_control::{
    FloodControl, FloodControlError, ManualClock, RedisStore, SlidingWindowFloodControl,
    WindowStore,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn store_config(prefix: &str) -> Option<StoreConfig> {
    let redis_url = std::env::var("FLOODCONTROL_TEST_REDIS_URL").ok()?;
    Some(StoreConfig {
        backend: StoreBackend::Redis,
        redis_url: Some(redis_url),
        key_prefix: prefix.to_string(),
        pool_max_open: 8,
        pool_get_timeout_seconds: 2,
    })
}

fn unique_prefix(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("floodcontrol-test:{}:{}:{}", name, std::process::id(), nanos)
}

async fn engine(
    config: &StoreConfig,
    clock: &ManualClock,
    window_seconds: u64,
    max_requests: u64,
) -> SlidingWindowFloodControl<RedisStore, ManualClock> {
    let store = RedisStore::connect(config, RetryPolicy::no_retry())
        .await
        .unwrap();
    let mut window = FloodControlConfig::new(window_seconds, max_requests);
    window.store_timeout_millis = 2_000;
    SlidingWindowFloodControl::with_clock(store, clock.clone(), &window).unwrap()
}

async fn drain(engine: &SlidingWindowFloodControl<RedisStore, ManualClock>, clock: &ManualClock) {
    clock.set(i64::MAX / 2);
    engine.remove_old_requests().await.unwrap();
    engine.reconcile().await.unwrap();
}

#[tokio::test]
async fn test_redis_window_scenario() {
    let Some(config) = store_config(&unique_prefix("scenario")) else {
        return;
    };
    let clock = ManualClock::new(1_000);
    let engine = engine(&config, &clock, 60, 2).await;

    assert!(engine.add_request(1).await.unwrap());
    clock.set(1_010);
    assert!(engine.add_request(1).await.unwrap());
    clock.set(1_020);
    assert!(!engine.add_request(1).await.unwrap());

    clock.set(1_071);
    assert_eq!(engine.remove_old_requests().await.unwrap().evicted, 2);
    assert_eq!(engine.occupancy(1).await.unwrap(), 0);
    assert!(engine.check(1).await.unwrap());
    assert!(engine.store().counter_snapshot().await.unwrap().is_empty());

    drain(&engine, &clock).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_replicas_share_the_limit() {
    let Some(config) = store_config(&unique_prefix("replicas")) else {
        return;
    };
    let clock = ManualClock::new(5_000);
    let first = Arc::new(engine(&config, &clock, 60, 3).await);
    let second = Arc::new(engine(&config, &clock, 60, 3).await);

    let attempts = (0..40).map(|i| {
        let replica = if i % 2 == 0 {
            Arc::clone(&first)
        } else {
            Arc::clone(&second)
        };
        tokio::spawn(async move { replica.add_request(99).await.unwrap() })
    });
    let admitted = join_all(attempts)
        .await
        .into_iter()
        .filter(|verdict| matches!(verdict, Ok(true)))
        .count();

    assert_eq!(admitted, 3);
    assert_eq!(first.occupancy(99).await.unwrap(), 3);

    drain(&first, &clock).await;
}

#[tokio::test]
async fn test_redis_corrupt_token_and_reconcile() {
    let Some(config) = store_config(&unique_prefix("corrupt")) else {
        return;
    };
    let clock = ManualClock::new(0);
    let engine = engine(&config, &clock, 60, 5).await;

    engine.store().queue_append("x:y:z").await.unwrap();
    assert!(matches!(
        engine.get_top_request().await,
        Err(FloodControlError::CorruptEntry { .. })
    ));
    assert_eq!(
        engine.discard_corrupt_head().await.unwrap().as_deref(),
        Some("x:y:z")
    );

    engine.insert_request(4, 0).await.unwrap();
    engine.store().counter_set(4, 3).await.unwrap();
    let drift = engine.reconcile().await.unwrap();
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].user_id, 4);
    assert_eq!(drift[0].recorded, 3);
    assert_eq!(drift[0].actual, 1);
    assert_eq!(engine.occupancy(4).await.unwrap(), 1);

    drain(&engine, &clock).await;
}

#[tokio::test]
async fn test_redis_reconcile_only_counts_canonical_tokens() {
    let Some(config) = store_config(&unique_prefix("canonical")) else {
        return;
    };
    let clock = ManualClock::new(0);
    let engine = engine(&config, &clock, 60, 5).await;

    for token in ["+5:0", "05:0", "5:00"] {
        engine.store().queue_append(token).await.unwrap();
    }
    engine.insert_request(5, 0).await.unwrap();
    engine.store().counter_set(6, 2).await.unwrap();

    let drift = engine.reconcile().await.unwrap();
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].user_id, 6);
    assert_eq!(drift[0].actual, 0);
    assert_eq!(engine.occupancy(5).await.unwrap(), 1);
    assert!(engine.reconcile().await.unwrap().is_empty());

    for _ in 0..3 {
        assert!(engine.discard_corrupt_head().await.unwrap().is_some());
    }
    drain(&engine, &clock).await;
}
