//! Scheduler: runs every mover each tick, one source at a time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldsync_cursor::{Cursor, CursorStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{MoverError, Result};
use crate::registry::SourceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// What one source did during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOutcome {
    pub source: String,
    pub moved: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<SourceOutcome>,
}

impl TickReport {
    pub fn moved(&self) -> usize {
        self.outcomes.iter().map(|o| o.moved).sum()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }

    pub fn outcome(&self, source: &str) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.source == source)
    }
}

/// Clears the running flag on every exit path.
struct RunningGuard<'a> {
    state: &'a Mutex<SchedulerState>,
}

impl<'a> RunningGuard<'a> {
    fn acquire(state: &'a Mutex<SchedulerState>) -> Result<Self> {
        let mut current = state.lock().unwrap();
        if *current == SchedulerState::Running {
            return Err(MoverError::AlreadyRunning);
        }
        *current = SchedulerState::Running;
        Ok(Self { state })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap() = SchedulerState::Idle;
    }
}

pub struct Scheduler {
    registry: SourceRegistry,
    cursors: Arc<dyn CursorStore>,
    poll_interval: Duration,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        registry: SourceRegistry,
        cursors: Arc<dyn CursorStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            cursors,
            poll_interval,
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Drain every source once, in registry order. A failing source is
    /// logged and recorded in the report; the others still run.
    pub async fn run_tick(&self, token: &CancellationToken) -> Result<TickReport> {
        let _running = RunningGuard::acquire(&self.state)?;
        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(self.registry.len());

        for mover in self.registry.iter() {
            if token.is_cancelled() {
                break;
            }
            let outcome = match mover.drain_at(started_at, token).await {
                Ok(moved) => {
                    if moved > 0 {
                        info!(source = mover.name(), delivered = moved, "Moved rows");
                    } else {
                        debug!(source = mover.name(), "Nothing to move");
                    }
                    SourceOutcome {
                        source: mover.name().to_string(),
                        moved,
                        error: None,
                    }
                }
                Err(e) => {
                    error!(source = mover.name(), error = %e, "Source failed this tick");
                    SourceOutcome {
                        source: mover.name().to_string(),
                        moved: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        Ok(TickReport {
            started_at,
            outcomes,
        })
    }

    /// Drain a single source now, e.g. for an operator-triggered replay.
    /// Rejected while a tick is running.
    pub async fn run_source(&self, name: &str, token: &CancellationToken) -> Result<usize> {
        let mover = self.registry.get(name)?;
        let _running = RunningGuard::acquire(&self.state)?;
        let moved = mover.drain_at(Utc::now(), token).await?;
        info!(source = name, delivered = moved, "Ran source on demand");
        Ok(moved)
    }

    /// Tick, sleep, repeat until cancelled. The in-flight tick always
    /// finishes its current batch; only the sleep is interrupted.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            sources = ?self.registry.names(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Scheduler started"
        );

        while !token.is_cancelled() {
            match self.run_tick(&token).await {
                Ok(report) if report.moved() > 0 || report.failed() > 0 => info!(
                    moved = report.moved(),
                    failed = report.failed(),
                    "Tick complete"
                ),
                Ok(_) => debug!("Tick complete, nothing moved"),
                Err(MoverError::AlreadyRunning) => debug!("Previous run still in progress, skipping tick"),
                Err(e) => error!(error = %e, "Tick failed"),
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Scheduler stopped");
    }

    pub async fn cursors(&self) -> Result<Vec<Cursor>> {
        Ok(self.cursors.list().await?)
    }
}
