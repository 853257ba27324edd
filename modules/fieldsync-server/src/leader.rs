use std::time::Duration;

use anyhow::Result;
use fieldsync_cursor::LeaderLock;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stand by until this process holds the leader lock for `scope`.
///
/// Returns `None` if `token` is cancelled first. Lock errors are retried on
/// the same interval as contention.
pub async fn wait_for_leadership(
    pool: &PgPool,
    scope: &str,
    retry: Duration,
    token: &CancellationToken,
) -> Result<Option<LeaderLock>> {
    let mut announced = false;
    loop {
        match LeaderLock::try_acquire(pool, scope).await {
            Ok(Some(lock)) => return Ok(Some(lock)),
            Ok(None) if !announced => {
                info!(scope, "Another process holds the leader lock, standing by");
                announced = true;
            }
            Ok(None) => {}
            Err(e) => warn!(scope, error = %e, "Leader lock attempt failed"),
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            _ = tokio::time::sleep(retry) => {}
        }
    }
}
