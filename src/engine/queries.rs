use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::{self, Occurrence, OccurrenceFilter};
use crate::limits::*;
use crate::model::*;
use crate::roles::{self, require_client};

use super::capacity::{available_slots, seats_taken};
use super::{Engine, EngineError};

impl Engine {
    /// Bookable timetable for `[from, to]`, inclusive, in studio dates.
    ///
    /// `is_past`/`is_today`/`is_future` compare the class date with today
    /// at the studio. `booking_open` is the stricter question: active, not
    /// started, and a seat left.
    pub async fn occurrences_in_range(
        &self,
        filter: OccurrenceFilter,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<OccurrenceView>, EngineError> {
        if from > to {
            return Err(EngineError::InvalidTimeRange);
        }
        if (to - from).num_days() + 1 > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        let mut entries = Vec::new();
        let mut taken: HashMap<Ulid, u32> = HashMap::new();
        for date in from.iter_days().take_while(|d| *d <= to) {
            for id in self.store.schedule_ids_on(&date) {
                let Some(cell) = self.store.get_schedule(&id) else {
                    continue;
                };
                let guard = cell.read().await;
                if guard.removed || !filter.matches(&guard.entry) {
                    continue;
                }
                taken.insert(id, seats_taken(&guard));
                entries.push(guard.entry.clone());
            }
        }

        let now = self.now_ms();
        let views = calendar::occurrences_in_range(&entries, from, to, self.studio())
            .into_iter()
            .map(|occ| {
                let seats = taken.get(&occ.schedule.id).copied().unwrap_or(0);
                self.occurrence_view(occ, seats, now)
            })
            .collect();
        Ok(views)
    }

    /// One entry with its seat counts, active or not.
    pub async fn get_schedule(&self, id: Ulid) -> Result<OccurrenceView, EngineError> {
        let cell = self
            .store
            .get_schedule(&id)
            .ok_or(EngineError::ScheduleNotFound(id))?;
        let guard = cell.read().await;
        if guard.removed {
            return Err(EngineError::ScheduleNotFound(id));
        }
        let occ = Occurrence {
            schedule: guard.entry.clone(),
            date: guard.entry.class_date,
            start: self.class_start(&guard.entry),
            end: self.class_end(&guard.entry),
        };
        Ok(self.occurrence_view(occ, seats_taken(&guard), self.now_ms()))
    }

    fn occurrence_view(&self, occ: Occurrence, taken: u32, now: Ms) -> OccurrenceView {
        let today = self.studio().local_date(now);
        let available = occ.schedule.max_participants.saturating_sub(taken);
        let booking_open = occ.schedule.is_active && now < occ.start && available > 0;
        OccurrenceView {
            span: occ.span(),
            date: occ.date,
            taken,
            available,
            is_past: occ.date < today,
            is_today: occ.date == today,
            is_future: occ.date > today,
            booking_open,
            entry: occ.schedule,
        }
    }

    /// A client's bookings split into active and history, with stats.
    ///
    /// Pure read. A `booked` record past the sweep cutoff is reported as
    /// `missed` in history without being rewritten; `reconcile` makes that
    /// durable. Until the cutoff it stays active, even once the class has
    /// started, since the trainer may still mark it.
    pub async fn client_bookings(&self, client: Ulid) -> Result<ClientBookings, EngineError> {
        require_client(&self.principal(client))?;
        let now = self.now_ms();

        let mut active = Vec::new();
        let mut history = Vec::new();
        for booking_id in self.store.client_booking_ids(&client) {
            let Some(schedule_id) = self.store.schedule_for_booking(&booking_id) else {
                continue;
            };
            let Some(cell) = self.store.get_schedule(&schedule_id) else {
                continue;
            };
            let guard = cell.read().await;
            let Some(booking) = guard.booking(&booking_id) else {
                continue;
            };
            let class_start = self.class_start(&guard.entry);
            let effective_status = if booking.status == BookingStatus::Booked
                && self.missed_cutoff(&guard.entry) < now
            {
                BookingStatus::Missed
            } else {
                booking.status
            };
            let view = BookingView {
                booking: booking.clone(),
                entry: guard.entry.clone(),
                class_start,
                effective_status,
            };
            if effective_status == BookingStatus::Booked {
                active.push(view);
            } else {
                history.push(view);
            }
        }

        active.sort_by_key(|v| (v.class_start, v.booking.id));
        history.sort_by(|a, b| {
            (b.booking.booking_date, b.booking.id).cmp(&(a.booking.booking_date, a.booking.id))
        });
        let stats = booking_stats(active.iter().chain(history.iter()));
        Ok(ClientBookings {
            active,
            history,
            stats,
        })
    }

    /// Every booking on one class, in the order they were made. For the
    /// class's own trainer, or an admin.
    pub async fn schedule_roster(&self, caller: Ulid, schedule_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let principal = self.principal(caller);
        let admin = roles::is_admin(&principal);
        if !admin && principal.role != Some(Role::Trainer) {
            return Err(EngineError::NotTrainer);
        }
        let cell = self
            .store
            .get_schedule(&schedule_id)
            .ok_or(EngineError::ScheduleNotFound(schedule_id))?;
        let guard = cell.read().await;
        if guard.removed {
            return Err(EngineError::ScheduleNotFound(schedule_id));
        }
        if !admin {
            roles::require_trainer_of(&principal, &guard.entry)?;
        }
        Ok(guard.bookings.clone())
    }

    /// Seats left right now on one class.
    pub async fn available_slots(&self, schedule_id: Ulid) -> Result<u32, EngineError> {
        let cell = self
            .store
            .get_schedule(&schedule_id)
            .ok_or(EngineError::ScheduleNotFound(schedule_id))?;
        let guard = cell.read().await;
        if guard.removed {
            return Err(EngineError::ScheduleNotFound(schedule_id));
        }
        Ok(available_slots(&guard))
    }

    pub fn list_styles(&self) -> Vec<DanceStyle> {
        let mut styles = self.store.styles();
        styles.sort_by(|a, b| (&a.name, a.id).cmp(&(&b.name, b.id)));
        styles
    }

    pub fn list_trainers(&self) -> Vec<Trainer> {
        let mut trainers = self.store.trainers();
        trainers.sort_by_key(|t| t.id);
        trainers
    }
}

/// Counts by effective status. `total_history` covers terminal records
/// only, and the attendance rate is attended over that.
pub(super) fn booking_stats<'a>(views: impl IntoIterator<Item = &'a BookingView>) -> BookingStats {
    let mut stats = BookingStats::default();
    for view in views {
        match view.effective_status {
            BookingStatus::Booked => stats.booked += 1,
            BookingStatus::Attended => stats.attended += 1,
            BookingStatus::Missed => stats.missed += 1,
            BookingStatus::Cancelled => stats.cancelled += 1,
        }
    }
    stats.total_history = stats.attended + stats.missed + stats.cancelled;
    stats.attendance_rate = if stats.total_history == 0 {
        0.0
    } else {
        stats.attended as f64 / stats.total_history as f64
    };
    stats
}
