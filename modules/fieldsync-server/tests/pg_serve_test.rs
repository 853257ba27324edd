//! Leader lock supervision while a mover service is running.
//!
//! Requirements: Docker (for Postgres via testcontainers)
//!
//! Run with: cargo test -p fieldsync-server --features test-utils --test pg_serve_test

#![cfg(feature = "test-utils")]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fieldsync_common::MoverConfig;
use fieldsync_cursor::{testutil, LeaderLock, MemoryCursorStore};
use fieldsync_mover::{catalog, MemoryBatchReader, MemoryTableSink};
use fieldsync_server::{build_scheduler, serve, MoverArgs};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

fn mover_config() -> MoverConfig {
    MoverConfig {
        batch_size: 10,
        batch_size_overrides: BTreeMap::new(),
        poll_interval: Duration::from_millis(100),
        max_lag: Duration::from_secs(60),
        tenant_filter: Vec::new(),
    }
}

async fn terminate_lock_holders(pool: &PgPool) -> i64 {
    sqlx::query_scalar(
        "SELECT count(pg_terminate_backend(pid)) FROM pg_locks \
         WHERE locktype = 'advisory' AND granted AND pid <> pg_backend_pid()",
    )
    .fetch_one(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn service_stops_when_its_lock_session_dies() {
    let (_container, pool) = testutil::postgres_container().await;
    let config = mover_config();
    let scheduler = build_scheduler(
        catalog::replication_sources(&config).unwrap(),
        Arc::new(MemoryBatchReader::new()),
        Arc::new(MemoryTableSink::new()),
        Arc::new(MemoryCursorStore::new()),
        &config,
    )
    .unwrap();

    let token = CancellationToken::new();
    let service = {
        let pool = pool.clone();
        let token = token.clone();
        tokio::spawn(async move {
            serve(&scheduler, &pool, "fieldsync.test", &MoverArgs::default(), token).await
        })
    };

    let mut terminated = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        terminated = terminate_lock_holders(&pool).await;
        if terminated > 0 {
            break;
        }
    }
    assert_eq!(terminated, 1, "service never took the lock");

    let result = tokio::time::timeout(Duration::from_secs(10), service)
        .await
        .expect("service kept running without its lock")
        .unwrap();
    let err = result.unwrap_err();
    assert!(err.to_string().contains("lost leader lock"));
    assert!(!token.is_cancelled());

    // The lock is free for the next instance.
    assert!(LeaderLock::try_acquire(&pool, "fieldsync.test").await.unwrap().is_some());
}

#[tokio::test]
async fn shutdown_releases_the_lock() {
    let (_container, pool) = testutil::postgres_container().await;
    let config = mover_config();
    let scheduler = build_scheduler(
        catalog::replication_sources(&config).unwrap(),
        Arc::new(MemoryBatchReader::new()),
        Arc::new(MemoryTableSink::new()),
        Arc::new(MemoryCursorStore::new()),
        &config,
    )
    .unwrap();

    let token = CancellationToken::new();
    let service = {
        let pool = pool.clone();
        let token = token.clone();
        tokio::spawn(async move {
            serve(&scheduler, &pool, "fieldsync.test", &MoverArgs::default(), token).await
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(LeaderLock::try_acquire(&pool, "fieldsync.test").await.unwrap().is_none());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), service)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(LeaderLock::try_acquire(&pool, "fieldsync.test").await.unwrap().is_some());
}
