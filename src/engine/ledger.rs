use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::BOOKINGS_TOTAL;
use crate::roles::{self, require_client};

use super::capacity::available_slots;
use super::conflict::check_fresh_id;
use super::store::InMemoryStore;
use super::{Engine, EngineError};

fn outcome_label(result: &Result<Booking, EngineError>) -> &'static str {
    match result {
        Ok(_) => "booked",
        Err(EngineError::ClassFull(_)) => "full",
        Err(EngineError::AlreadyBooked(_)) => "duplicate",
        Err(EngineError::ClassAlreadyStarted(_)) => "started",
        Err(EngineError::ConcurrencyConflict(_)) => "conflict",
        Err(_) => "rejected",
    }
}

/// A booking id held in the store's index while its booking is being
/// decided. Released on drop unless the booking landed.
struct IdClaim<'a> {
    store: &'a InMemoryStore,
    id: Ulid,
    schedule_id: Ulid,
    landed: bool,
}

impl<'a> IdClaim<'a> {
    fn take(store: &'a InMemoryStore, id: Ulid, schedule_id: Ulid) -> Result<Self, EngineError> {
        if !store.reserve_booking_id(id, schedule_id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(Self {
            store,
            id,
            schedule_id,
            landed: false,
        })
    }

    fn keep(&mut self) {
        self.landed = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.landed {
            self.store.release_booking_id(&self.id, &self.schedule_id);
        }
    }
}

impl Engine {
    /// Reserve a seat for `client` on `schedule_id`.
    ///
    /// Checks run in a fixed order and the first failure wins: role,
    /// existence, active, not yet started, no prior booking, a free seat.
    /// Everything after the existence check runs under the schedule's
    /// write lock, so the seat count cannot change between check and insert.
    /// The booking id is claimed in the store first, so two requests
    /// carrying the same id cannot both land, on one class or on two.
    pub async fn book(&self, client: Ulid, id: Ulid, schedule_id: Ulid) -> Result<Booking, EngineError> {
        let result = self.book_inner(client, id, schedule_id).await;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        result
    }

    async fn book_inner(&self, client: Ulid, id: Ulid, schedule_id: Ulid) -> Result<Booking, EngineError> {
        require_client(&self.principal(client))?;
        check_fresh_id(&self.store, &id)?;
        let mut claim = IdClaim::take(&self.store, id, schedule_id)?;

        let mut guard = self.schedule_write(schedule_id).await?;

        if !guard.entry.is_active {
            return Err(EngineError::ScheduleInactive(schedule_id));
        }
        let now = self.now_ms();
        if now >= self.class_start(&guard.entry) {
            return Err(EngineError::ClassAlreadyStarted(schedule_id));
        }
        if guard.booking_for_client(&client).is_some() {
            return Err(EngineError::AlreadyBooked(schedule_id));
        }
        if available_slots(&guard) == 0 {
            return Err(EngineError::ClassFull(guard.entry.max_participants));
        }

        let booking = Booking {
            id,
            client_id: client,
            schedule_id,
            class_date: guard.entry.class_date,
            booking_date: now,
            status: BookingStatus::Booked,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.keep();
        debug!("client {client} booked {schedule_id} as {id}");
        Ok(booking)
    }

    /// Client cancels their own booking. The record stays, as `cancelled`.
    /// Someone else's booking reads as not found.
    pub async fn cancel(&self, client: Ulid, booking_id: Ulid) -> Result<Booking, EngineError> {
        require_client(&self.principal(client))?;
        let schedule_id = self
            .store
            .schedule_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let mut guard = match self.schedule_write(schedule_id).await {
            Ok(g) => g,
            // cascaded away while we waited
            Err(EngineError::ConcurrencyConflict(_)) | Err(EngineError::ScheduleNotFound(_)) => {
                return Err(EngineError::BookingNotFound(booking_id));
            }
            Err(e) => return Err(e),
        };

        let current = match guard.booking(&booking_id) {
            Some(b) if b.client_id == client => b.status,
            _ => return Err(EngineError::BookingNotFound(booking_id)),
        };
        if !current.can_transition_to(BookingStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: BookingStatus::Cancelled,
            });
        }

        let event = Event::BookingsTransitioned {
            schedule_id,
            ids: vec![booking_id],
            status: BookingStatus::Cancelled,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("client {client} cancelled {booking_id}");
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))
    }

    pub async fn mark_attended(&self, trainer: Ulid, schedule_id: Ulid) -> Result<usize, EngineError> {
        self.mark_all(trainer, schedule_id, BookingStatus::Attended).await
    }

    pub async fn mark_cancelled(&self, trainer: Ulid, schedule_id: Ulid) -> Result<usize, EngineError> {
        self.mark_all(trainer, schedule_id, BookingStatus::Cancelled).await
    }

    /// Trainer bulk update. Only `booked` records move; terminal ones are
    /// left alone. One WAL record per call, so it lands whole or not at all.
    async fn mark_all(
        &self,
        trainer: Ulid,
        schedule_id: Ulid,
        status: BookingStatus,
    ) -> Result<usize, EngineError> {
        let principal = self.principal(trainer);
        if principal.role != Some(Role::Trainer) {
            return Err(EngineError::NotTrainer);
        }

        let mut guard = self.schedule_write(schedule_id).await?;
        roles::require_trainer_of(&principal, &guard.entry)?;
        if self.now_ms() < self.class_start(&guard.entry) {
            return Err(EngineError::ClassNotStarted(schedule_id));
        }

        let ids = guard.ids_with_status(BookingStatus::Booked);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        let event = Event::BookingsTransitioned {
            schedule_id,
            ids,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("trainer {trainer} marked {count} bookings {status} on {schedule_id}");
        Ok(count)
    }
}
