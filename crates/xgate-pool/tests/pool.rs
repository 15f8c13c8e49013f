use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use xgate_pool::{
    AcquireError, ClassHint, Outcome, Persister, PoolEvent, PoolEventHub, QuotaBucket, TokenClass,
    TokenPool, TokenRecord,
};
use xgate_storage::{MemoryStore, TokenStore};

async fn pool_with(ids: &[&str], class: TokenClass) -> TokenPool {
    let pool = TokenPool::new(5, PoolEventHub::new(32));
    let entries = ids
        .iter()
        .map(|id| (id.to_string(), TokenRecord::new(class)))
        .collect();
    pool.import(entries).await;
    pool
}

#[tokio::test]
async fn selection_is_fair_across_equal_tokens() {
    let pool = pool_with(&["a", "b", "c"], TokenClass::Basic).await;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..30 {
        let lease = pool.acquire(ClassHint::Basic).await.unwrap();
        *counts.entry(lease.id.clone()).or_default() += 1;
        pool.release(lease, Outcome::Success { quota_hint: None }).await;
    }
    for id in ["a", "b", "c"] {
        assert_eq!(counts[id], 10, "token {id} was not served its fair share");
    }
}

#[tokio::test]
async fn failure_threshold_disables_token() {
    let pool = pool_with(&["only"], TokenClass::Basic).await;
    let mut events = pool.subscribe_changes();

    for round in 0..5 {
        let lease = pool.acquire(ClassHint::Basic).await.unwrap();
        pool.release(
            lease,
            Outcome::TransientFailure {
                status: Some(500),
                reason: format!("http 500 round {round}"),
            },
        )
        .await;
    }

    let record = pool.get(&"only".to_string()).await.unwrap();
    assert!(record.disabled);
    assert_eq!(record.consecutive_failures, 5);
    assert!(matches!(
        pool.acquire(ClassHint::Basic).await,
        Err(AcquireError::PoolEmpty { .. })
    ));

    // The threshold crossing is announced exactly once.
    let mut disabled_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PoolEvent::Disabled { .. }) {
            disabled_events += 1;
        }
    }
    assert_eq!(disabled_events, 1);
}

#[tokio::test]
async fn success_resets_failure_counter() {
    let pool = pool_with(&["t"], TokenClass::Basic).await;

    for _ in 0..4 {
        let lease = pool.acquire(ClassHint::Basic).await.unwrap();
        pool.release(
            lease,
            Outcome::TransientFailure {
                status: Some(500),
                reason: "http 500".to_string(),
            },
        )
        .await;
    }
    assert_eq!(pool.get(&"t".to_string()).await.unwrap().consecutive_failures, 4);

    let lease = pool.acquire(ClassHint::Basic).await.unwrap();
    pool.release(lease, Outcome::Success { quota_hint: None }).await;

    let record = pool.get(&"t".to_string()).await.unwrap();
    assert_eq!(record.consecutive_failures, 0);
    assert!(!record.disabled);
}

#[tokio::test]
async fn acquire_excluding_never_returns_tried_ids() {
    let pool = pool_with(&["x", "y"], TokenClass::Basic).await;

    let first = pool.acquire(ClassHint::Basic).await.unwrap();
    let second = pool
        .acquire_excluding(ClassHint::Basic, &[first.id.clone()])
        .await
        .unwrap();
    assert_ne!(first.id, second.id);

    let exhausted = pool
        .acquire_excluding(ClassHint::Basic, &[first.id.clone(), second.id.clone()])
        .await;
    assert!(matches!(exhausted, Err(AcquireError::PoolEmpty { .. })));
}

#[tokio::test]
async fn super_preferred_falls_back_to_basic() {
    let pool = TokenPool::new(5, PoolEventHub::new(8));
    pool.import(vec![("basic-1".to_string(), TokenRecord::new(TokenClass::Basic))])
        .await;

    let lease = pool.acquire(ClassHint::SuperPreferred).await.unwrap();
    assert_eq!(lease.class, TokenClass::Basic);
    assert!(lease.fell_back);

    pool.import(vec![("super-1".to_string(), TokenRecord::new(TokenClass::Super))])
        .await;
    let lease = pool.acquire(ClassHint::SuperPreferred).await.unwrap();
    assert_eq!(lease.class, TokenClass::Super);
    assert!(!lease.fell_back);
}

#[tokio::test]
async fn quota_exhausted_cools_without_counting_failures() {
    let pool = pool_with(&["cooled", "fresh"], TokenClass::Basic).await;

    let lease = pool.acquire(ClassHint::Basic).await.unwrap();
    let cooled_id = lease.id.clone();
    pool.release(
        lease,
        Outcome::QuotaExhausted {
            reset_at: OffsetDateTime::now_utc() + Duration::from_secs(60),
        },
    )
    .await;

    let record = pool.get(&cooled_id).await.unwrap();
    assert_eq!(record.consecutive_failures, 0);
    assert!(!record.disabled);
    assert!(pool.cooling_until(&cooled_id).await.is_some());

    // While cooled, only the other token is ever selected.
    for _ in 0..4 {
        let lease = pool.acquire(ClassHint::Basic).await.unwrap();
        assert_ne!(lease.id, cooled_id);
        pool.release(lease, Outcome::Success { quota_hint: None }).await;
    }
}

#[tokio::test]
async fn expired_cooling_recovers_lazily() {
    let pool = pool_with(&["solo"], TokenClass::Basic).await;

    let lease = pool.acquire(ClassHint::Basic).await.unwrap();
    pool.release(
        lease,
        Outcome::QuotaExhausted {
            reset_at: OffsetDateTime::now_utc() + Duration::from_millis(50),
        },
    )
    .await;
    assert!(matches!(
        pool.acquire(ClassHint::Basic).await,
        Err(AcquireError::PoolEmpty { .. })
    ));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(pool.acquire(ClassHint::Basic).await.is_ok());
}

#[tokio::test]
async fn quota_tiebreak_prefers_larger_remaining() {
    let pool = TokenPool::new(5, PoolEventHub::new(8));
    let mut low = TokenRecord::new(TokenClass::Basic);
    low.set_quota(QuotaBucket::Default, 3, None);
    low.last_used_at = Some(OffsetDateTime::now_utc());
    let mut high = TokenRecord::new(TokenClass::Basic);
    high.set_quota(QuotaBucket::Default, 80, None);
    high.last_used_at = low.last_used_at;
    pool.import(vec![
        ("low".to_string(), low),
        ("high".to_string(), high),
    ])
    .await;

    let lease = pool.acquire(ClassHint::Basic).await.unwrap();
    assert_eq!(lease.id, "high");
}

#[tokio::test]
async fn persistence_round_trip_preserves_records() {
    let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
    let pool = Arc::new(TokenPool::new(5, PoolEventHub::new(8)));
    let persister = Persister::bootstrap(pool.clone(), store.clone()).await.unwrap();

    let mut record = TokenRecord::new(TokenClass::Super);
    record.tags.insert("content-mode-enabled".to_string());
    record.note = "imported from ops sheet".to_string();
    record
        .extra
        .insert("future_field".to_string(), serde_json::json!({"keep": true}));
    pool.import(vec![("sso-abc".to_string(), record.clone())]).await;
    persister.flush_dirty().await;

    // A second worker boots from the same store and sees the same record.
    let other_pool = Arc::new(TokenPool::new(5, PoolEventHub::new(8)));
    Persister::bootstrap(other_pool.clone(), store.clone()).await.unwrap();
    let loaded = other_pool.get(&"sso-abc".to_string()).await.unwrap();
    assert_eq!(loaded, record);
}

#[tokio::test]
async fn reload_applies_peer_writes_by_version() {
    let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
    let pool = Arc::new(TokenPool::new(5, PoolEventHub::new(8)));
    let persister = Persister::bootstrap(pool.clone(), store.clone()).await.unwrap();

    pool.import(vec![("shared".to_string(), TokenRecord::new(TokenClass::Basic))])
        .await;
    persister.flush_dirty().await;

    // Simulate a peer worker bumping the record in storage.
    let mut peer_record = TokenRecord::new(TokenClass::Basic);
    peer_record.note = "updated by peer".to_string();
    let row = store.get("shared").await.unwrap().unwrap();
    store
        .put(
            "shared",
            serde_json::to_value(&peer_record).unwrap(),
            Some(row.version),
        )
        .await
        .unwrap();

    let applied = persister.reload_changed().await.unwrap();
    assert_eq!(applied, 1);
    assert_eq!(
        pool.get(&"shared".to_string()).await.unwrap().note,
        "updated by peer"
    );
}
