use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::InMemoryStore;
use super::EngineError;

pub(crate) fn validate_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::LimitExceeded("name must not be empty"));
    }
    validate_text(name, MAX_NAME_LEN, "name too long")
}

/// Shape checks that need nothing but the entry itself.
pub(crate) fn validate_entry(entry: &ScheduleEntry) -> Result<(), EngineError> {
    if entry.max_participants == 0 || entry.max_participants > MAX_PARTICIPANTS {
        return Err(EngineError::InvalidCapacity(entry.max_participants));
    }
    if entry.start_time >= entry.end_time {
        return Err(EngineError::InvalidTimeRange);
    }
    let duration = entry.duration_ms();
    if !(MIN_CLASS_DURATION_MS..=MAX_CLASS_DURATION_MS).contains(&duration) {
        return Err(EngineError::DurationOutOfRange(duration));
    }
    Ok(())
}

/// Style and trainer must both exist.
pub(crate) fn check_references(store: &InMemoryStore, entry: &ScheduleEntry) -> Result<(), EngineError> {
    if !store.contains_style(&entry.dance_style) {
        return Err(EngineError::NotFound(entry.dance_style));
    }
    if !store.contains_trainer(&entry.trainer) {
        return Err(EngineError::NotFound(entry.trainer));
    }
    Ok(())
}

/// No other active entry of the same trainer on the same date may overlap.
/// Inactive entries never conflict. `entry` itself is skipped by id, so the
/// caller may hold its cell's write lock.
pub(crate) async fn check_trainer_free(
    store: &InMemoryStore,
    entry: &ScheduleEntry,
) -> Result<(), EngineError> {
    if !entry.is_active {
        return Ok(());
    }
    for other_id in store.trainer_schedules_on(entry.trainer, entry.class_date) {
        if other_id == entry.id {
            continue;
        }
        let Some(cell) = store.get_schedule(&other_id) else {
            continue;
        };
        let other = cell.read().await;
        if other.removed || !other.entry.is_active {
            continue;
        }
        if other.entry.overlaps(entry) {
            return Err(EngineError::TrainerConflict(other_id));
        }
    }
    Ok(())
}

/// Ids are caller-supplied; refuse to reuse one that names anything else.
pub(crate) fn check_fresh_id(store: &InMemoryStore, id: &Ulid) -> Result<(), EngineError> {
    if store.contains_schedule(id)
        || store.contains_style(id)
        || store.contains_trainer(id)
        || store.contains_account(id)
        || store.schedule_for_booking(id).is_some()
    {
        return Err(EngineError::AlreadyExists(*id));
    }
    Ok(())
}
