//! Single-active-mover guard built on a Postgres session advisory lock.

use sqlx::{Connection, PgConnection, PgPool};
use tracing::info;

use crate::error::Result;

/// An advisory lock held for the life of a dedicated connection.
///
/// The connection is detached from the pool, so dropping the guard closes it
/// and Postgres releases the lock even if [`LeaderLock::release`] is never
/// called.
pub struct LeaderLock {
    conn: PgConnection,
    scope: String,
}

impl LeaderLock {
    /// Try once to become the active mover for `scope`.
    ///
    /// Returns `Ok(None)` when another process already holds the lock.
    pub async fn try_acquire(pool: &PgPool, scope: &str) -> Result<Option<Self>> {
        let mut conn = pool.acquire().await?.detach();
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(scope)
            .fetch_one(&mut conn)
            .await?;

        if !acquired {
            conn.close().await?;
            return Ok(None);
        }

        info!(scope, "Acquired leader lock");
        Ok(Some(Self {
            conn,
            scope: scope.to_string(),
        }))
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Confirm the session holding the lock is still alive.
    ///
    /// Postgres drops a session's advisory locks when its connection goes
    /// away, so a failed round trip means leadership may already be lost.
    pub async fn check(&mut self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&mut self.conn).await?;
        Ok(())
    }

    /// Unlock and close the dedicated connection.
    pub async fn release(mut self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&self.scope)
            .execute(&mut self.conn)
            .await?;
        self.conn.close().await?;
        info!(scope = %self.scope, "Released leader lock");
        Ok(())
    }
}
