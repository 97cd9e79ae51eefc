use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{RECONCILED_TOTAL, RECONCILE_DURATION_SECONDS};

use super::{Engine, EngineError};

impl Engine {
    /// Instant after which a class's leftover `booked` seats count as missed.
    pub(super) fn missed_cutoff(&self, entry: &ScheduleEntry) -> Ms {
        self.class_start(entry) + self.missed_grace_ms()
    }

    /// Schedules holding `booked` records past their cutoff. Waits out any
    /// writer on a cell rather than skipping it, so one pass sees everything.
    pub async fn collect_stale(&self, now: Ms) -> Vec<Ulid> {
        let mut stale = Vec::new();
        for id in self.store.schedule_ids() {
            let Some(cell) = self.store.get_schedule(&id) else {
                continue;
            };
            let guard = cell.read().await;
            if !guard.removed
                && self.missed_cutoff(&guard.entry) < now
                && guard.bookings.iter().any(|b| b.status == BookingStatus::Booked)
            {
                stale.push(id);
            }
        }
        stale
    }

    /// Move every `booked` record whose class started before `now` (plus
    /// grace) to `missed`. Returns how many records changed. Running it
    /// twice in a row changes nothing the second time.
    ///
    /// Each schedule is handled under its own lock and status is re-read
    /// there, so this interleaves with booking and cancellation. A schedule
    /// that fails is logged and left for the next run.
    pub async fn reconcile(&self, now: Ms) -> usize {
        let started = Instant::now();
        let mut updated = 0;
        for schedule_id in self.collect_stale(now).await {
            match self.reconcile_schedule(schedule_id, now).await {
                Ok(n) => updated += n,
                Err(e) => warn!("reconcile skip {schedule_id}: {e}"),
            }
        }
        metrics::counter!(RECONCILED_TOTAL).increment(updated as u64);
        metrics::histogram!(RECONCILE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if updated > 0 {
            info!("reconcile marked {updated} bookings missed");
        }
        updated
    }

    /// On-demand sweep at the engine's current time. Admin only.
    pub async fn sweep_missed(&self, admin: Ulid) -> Result<usize, EngineError> {
        crate::roles::require_admin(&self.principal(admin))?;
        Ok(self.reconcile(self.now_ms()).await)
    }

    async fn reconcile_schedule(&self, schedule_id: Ulid, now: Ms) -> Result<usize, EngineError> {
        let mut guard = self.schedule_write(schedule_id).await?;
        if self.missed_cutoff(&guard.entry) >= now {
            // rescheduled since we looked
            return Ok(0);
        }
        let ids = guard.ids_with_status(BookingStatus::Booked);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        let event = Event::BookingsTransitioned {
            schedule_id,
            ids,
            status: BookingStatus::Missed,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("swept {count} bookings on {schedule_id} to missed");
        Ok(count)
    }
}
