mod capacity;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
mod reconcile;
mod store;
#[cfg(test)]
mod tests;

pub use capacity::{available_slots, is_full, seats_taken};
pub use error::EngineError;
pub use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::clock::{Clock, StudioTime};
use crate::model::*;
use crate::roles::Principal;
use crate::wal::Wal;

pub type SharedScheduleState = Arc<RwLock<ScheduleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Blocks for one append, drains whatever else is already
/// queued, then commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // commit what we have before compacting or counting
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so no half-written batch bleeds
    // into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The booking and scheduling engine.
///
/// Per-schedule write locks serialize everything that touches one class's
/// bookings. Catalog writes additionally take `catalog_lock` so overlap
/// checks see a stable timetable.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) catalog_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
    studio: StudioTime,
    missed_grace_ms: Ms,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be
    /// called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>, studio: StudioTime) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            catalog_lock: Mutex::new(()),
            clock,
            studio,
            missed_grace_ms: 0,
        };

        // Sole owner of every cell here, so try_write always succeeds.
        // Never blocking_write: this may run inside the runtime.
        for event in &events {
            match store::event_schedule_id(event) {
                Some(schedule_id) => {
                    if let Some(cell) = engine.store.get_schedule(&schedule_id) {
                        let mut guard = cell.try_write().expect("replay: uncontended write");
                        engine.store.apply_schedule_event(&mut guard, event);
                    }
                }
                None => engine.store.apply_catalog_event(event),
            }
        }

        info!(
            "replayed {} events: {} schedules, {} accounts",
            events.len(),
            engine.store.schedule_count(),
            engine.store.account_count()
        );
        Ok(engine)
    }

    /// Bookings stay `booked` this long past class start before the sweep
    /// marks them missed.
    pub fn with_missed_grace(mut self, grace_ms: Ms) -> Self {
        self.missed_grace_ms = grace_ms.max(0);
        self
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn studio(&self) -> &StudioTime {
        &self.studio
    }

    pub fn missed_grace_ms(&self) -> Ms {
        self.missed_grace_ms
    }

    pub fn principal(&self, account_id: Ulid) -> Principal {
        self.store.principal(account_id)
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub(super) fn class_start(&self, entry: &ScheduleEntry) -> Ms {
        self.studio.combine(entry.class_date, entry.start_time)
    }

    pub(super) fn class_end(&self, entry: &ScheduleEntry) -> Ms {
        self.studio.combine(entry.class_date, entry.end_time)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Durable first, then visible. Caller holds the cell's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut ScheduleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_schedule_event(ss, event);
        Ok(())
    }

    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_catalog_event(event);
        Ok(())
    }

    /// Look up a schedule cell and take its write lock. A cell deleted
    /// while we queued yields `ConcurrencyConflict`.
    pub(super) async fn schedule_write(
        &self,
        schedule_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ScheduleState>, EngineError> {
        let cell = self
            .store
            .get_schedule(&schedule_id)
            .ok_or(EngineError::ScheduleNotFound(schedule_id))?;
        let guard = cell.write_owned().await;
        if guard.removed {
            return Err(EngineError::ConcurrencyConflict(schedule_id));
        }
        Ok(guard)
    }
}
