//! Shared wiring for the two mover binaries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use fieldsync_common::MoverConfig;
use fieldsync_cursor::{CursorStore, LeaderLock};
use fieldsync_mover::{
    BatchReader, Mover, Scheduler, SinkWriter, SourceDescriptor, SourceRegistry,
};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::leader::wait_for_leadership;

#[derive(Args, Debug, Clone, Default)]
pub struct MoverArgs {
    /// Run a single tick over every source and exit.
    #[arg(long)]
    pub once: bool,

    /// Drain only this source and exit.
    #[arg(long, value_name = "NAME", conflicts_with = "once")]
    pub source: Option<String>,
}

pub fn build_scheduler(
    sources: Vec<SourceDescriptor>,
    reader: Arc<dyn BatchReader>,
    sink: Arc<dyn SinkWriter>,
    cursors: Arc<dyn CursorStore>,
    mover: &MoverConfig,
) -> Result<Scheduler> {
    let movers = sources
        .into_iter()
        .map(|source| Mover::new(source, reader.clone(), sink.clone(), cursors.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    let registry = SourceRegistry::new(movers)?;
    Ok(Scheduler::new(registry, cursors, mover.poll_interval))
}

/// Hold the leader lock for `scope` and run `scheduler` until `token` is
/// cancelled (or once, per `args`).
pub async fn serve(
    scheduler: &Scheduler,
    lock_pool: &PgPool,
    scope: &str,
    args: &MoverArgs,
    token: CancellationToken,
) -> Result<()> {
    let retry = scheduler.poll_interval();
    let Some(mut lock) = wait_for_leadership(lock_pool, scope, retry, &token).await? else {
        info!(scope, "Cancelled while standing by");
        return Ok(());
    };

    let leading = token.child_token();
    let (result, lost) = tokio::join!(
        async {
            let result = run(scheduler, args, leading.clone()).await;
            leading.cancel();
            result
        },
        watch_leadership(&mut lock, retry, &leading),
    );

    if lost {
        drop(lock);
        result?;
        anyhow::bail!("lost leader lock for {scope}");
    }
    if let Err(e) = lock.release().await {
        error!(scope, error = %e, "Failed to release leader lock");
    }
    result
}

/// Check the lock every `interval` until `leading` is cancelled.
///
/// Returns `true` after cancelling `leading` when the lock session is gone.
async fn watch_leadership(
    lock: &mut LeaderLock,
    interval: Duration,
    leading: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            biased;
            _ = leading.cancelled() => return false,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = lock.check().await {
            error!(scope = lock.scope(), error = %e, "Leader lock session lost, stopping");
            leading.cancel();
            return true;
        }
    }
}

async fn run(scheduler: &Scheduler, args: &MoverArgs, token: CancellationToken) -> Result<()> {
    if let Some(name) = &args.source {
        let moved = scheduler.run_source(name, &token).await?;
        info!(source = %name, moved, "Source drained");
        return Ok(());
    }

    if args.once {
        let report = scheduler.run_tick(&token).await?;
        for outcome in &report.outcomes {
            match &outcome.error {
                Some(e) => error!(source = %outcome.source, error = %e, "Source failed"),
                None => info!(source = %outcome.source, moved = outcome.moved, "Source drained"),
            }
        }
        if report.failed() > 0 {
            anyhow::bail!("{} of {} sources failed", report.failed(), report.outcomes.len());
        }
        return Ok(());
    }

    scheduler.run(token).await;
    Ok(())
}
