//! Integration tests for the Postgres cursor store and leader lock.
//!
//! Requirements: Docker (for Postgres via testcontainers)
//!
//! Run with: cargo test -p fieldsync-cursor --features test-utils --test pg_cursor_test

#![cfg(feature = "test-utils")]

use chrono::{DateTime, TimeZone, Utc};
use fieldsync_cursor::{testutil, CursorStore, LeaderLock, PgCursorStore};
use serde_json::{json, Map};

#[tokio::test]
async fn get_creates_then_set_overwrites() {
    let (_container, pool) = testutil::postgres_container().await;
    let store = PgCursorStore::new(pool);

    let fresh = store.get("device_readings").await.unwrap();
    assert_eq!(fresh.last_timestamp, DateTime::<Utc>::UNIX_EPOCH);
    assert!(fresh.last_key.is_empty());

    let ts = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
    let mut key = Map::new();
    key.insert("tenant_id".into(), json!("t1"));
    key.insert("device_id".into(), json!("d9"));
    store.set("device_readings", ts, key.clone()).await.unwrap();

    let again = store.get("device_readings").await.unwrap();
    assert_eq!(again.last_timestamp, ts);
    assert_eq!(again.last_key, key);
    assert!(again.updated_at.is_some());
}

#[tokio::test]
async fn get_is_idempotent_and_list_is_sorted() {
    let (_container, pool) = testutil::postgres_container().await;
    let store = PgCursorStore::new(pool);

    store.get("sweep_readings").await.unwrap();
    store.get("sweep_readings").await.unwrap();
    store.get("device_health").await.unwrap();

    let names: Vec<_> = store.list().await.unwrap().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["device_health", "sweep_readings"]);
}

#[tokio::test]
async fn null_timestamp_reads_as_epoch() {
    let (_container, pool) = testutil::postgres_container().await;
    sqlx::query("INSERT INTO sensors.stream_state (name, last_time, last_key) VALUES ('legacy', NULL, NULL)")
        .execute(&pool)
        .await
        .unwrap();

    let cursor = PgCursorStore::new(pool).get("legacy").await.unwrap();
    assert_eq!(cursor.last_timestamp, DateTime::<Utc>::UNIX_EPOCH);
    assert!(cursor.last_key.is_empty());
}

#[tokio::test]
async fn leader_lock_is_exclusive_until_released() {
    let (_container, pool) = testutil::postgres_container().await;

    let first = LeaderLock::try_acquire(&pool, "sync-service")
        .await
        .unwrap()
        .expect("first acquire should win");
    assert!(LeaderLock::try_acquire(&pool, "sync-service").await.unwrap().is_none());

    first.release().await.unwrap();
    let second = LeaderLock::try_acquire(&pool, "sync-service").await.unwrap();
    assert!(second.is_some());
}

#[tokio::test]
async fn dropping_leader_lock_frees_it() {
    let (_container, pool) = testutil::postgres_container().await;

    let lock = LeaderLock::try_acquire(&pool, "sensor-streamer").await.unwrap();
    assert!(lock.is_some());
    drop(lock);

    // Closing happens in the background after drop.
    let mut reacquired = None;
    for _ in 0..20 {
        reacquired = LeaderLock::try_acquire(&pool, "sensor-streamer").await.unwrap();
        if reacquired.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert!(reacquired.is_some());
}

#[tokio::test]
async fn check_fails_once_the_lock_session_is_gone() {
    let (_container, pool) = testutil::postgres_container().await;

    let mut lock = LeaderLock::try_acquire(&pool, "sync-service")
        .await
        .unwrap()
        .expect("lock should be free");
    lock.check().await.unwrap();

    let terminated: i64 = sqlx::query_scalar(
        "SELECT count(pg_terminate_backend(pid)) FROM pg_locks \
         WHERE locktype = 'advisory' AND granted AND pid <> pg_backend_pid()",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(terminated, 1);

    assert!(lock.check().await.is_err());
    assert!(LeaderLock::try_acquire(&pool, "sync-service").await.unwrap().is_some());
}
