//! Mover: read a batch, deliver it, then advance the cursor.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fieldsync_cursor::{key_map, CursorStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::descriptor::SourceDescriptor;
use crate::error::{MoverError, Result};
use crate::reader::BatchReader;
use crate::sink::SinkWriter;

/// Where a mover is within one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoverPhase {
    Idle,
    Reading,
    Delivering,
    Advancing,
}

/// Puts the mover back to `Idle` on every exit path of a step.
struct PhaseGuard<'a> {
    phase: &'a Mutex<MoverPhase>,
}

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a Mutex<MoverPhase>) -> Self {
        let guard = Self { phase };
        guard.set(MoverPhase::Reading);
        guard
    }

    fn set(&self, next: MoverPhase) {
        *self.phase.lock().unwrap() = next;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.set(MoverPhase::Idle);
    }
}

/// One source's reader, sink and cursor store.
///
/// The cursor only moves after the sink confirmed the batch, and only
/// forwards, so a failed step is simply retried from the same place.
pub struct Mover {
    source: SourceDescriptor,
    reader: Arc<dyn BatchReader>,
    sink: Arc<dyn SinkWriter>,
    cursors: Arc<dyn CursorStore>,
    phase: Mutex<MoverPhase>,
}

impl Mover {
    /// Fails fast on an invalid descriptor.
    pub fn new(
        source: SourceDescriptor,
        reader: Arc<dyn BatchReader>,
        sink: Arc<dyn SinkWriter>,
        cursors: Arc<dyn CursorStore>,
    ) -> Result<Self> {
        source.validate()?;
        Ok(Self {
            source,
            reader,
            sink,
            cursors,
            phase: Mutex::new(MoverPhase::Idle),
        })
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn phase(&self) -> MoverPhase {
        *self.phase.lock().unwrap()
    }

    pub async fn step(&self) -> Result<usize> {
        self.step_at(Utc::now()).await
    }

    /// Move one batch. Returns the number of rows delivered; 0 means the
    /// source is drained up to `now - lag_horizon`.
    pub async fn step_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let phase = PhaseGuard::enter(&self.phase);
        let source = &self.source;
        let cursor_name = source.cursor_name();

        let cursor = self.cursors.get(cursor_name).await?;
        if cursor.has_unreadable_key(source.key_layout()) {
            warn!(
                source = %source.name,
                last_key = ?cursor.last_key,
                "Cursor key unreadable, falling back to column minimum"
            );
        }
        let after = cursor.position(source.key_layout());

        let rows = self.reader.next_batch(source, &after, now).await?;
        let Some(last) = rows.last() else {
            return Ok(0);
        };

        phase.set(MoverPhase::Delivering);
        self.sink.deliver(source, &rows).await?;

        phase.set(MoverPhase::Advancing);
        let next = last.position();
        if next <= after {
            return Err(MoverError::CursorRegression {
                name: source.name.clone(),
                from: after.to_string(),
                to: next.to_string(),
            });
        }
        let last_key = key_map(source.key_columns.iter().map(|c| c.name.as_str()), &next);
        self.cursors.set(cursor_name, next.time, last_key).await?;

        debug!(source = %source.name, delivered = rows.len(), cursor = %next, "Advanced cursor");
        Ok(rows.len())
    }

    /// Step until the source is drained or cancellation is requested. The
    /// token is only checked between batches, so a batch in flight always
    /// completes.
    pub async fn drain_at(&self, now: DateTime<Utc>, token: &CancellationToken) -> Result<usize> {
        let mut total = 0;
        while !token.is_cancelled() {
            let moved = self.step_at(now).await?;
            if moved == 0 {
                break;
            }
            total += moved;
        }
        Ok(total)
    }
}
