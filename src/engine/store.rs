use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;
use crate::roles::Principal;

use super::SharedScheduleState;

/// All in-memory state plus the secondary indexes that keep reads off the
/// per-schedule locks where possible.
///
/// Catalog entities (accounts, styles, trainers) are plain map values.
/// Each schedule lives in its own lock cell together with its bookings.
pub struct InMemoryStore {
    schedules: DashMap<Ulid, SharedScheduleState>,
    /// booking id → schedule id
    booking_index: DashMap<Ulid, Ulid>,
    /// client account id → booking ids, insertion order
    client_index: DashMap<Ulid, Vec<Ulid>>,
    /// class date → schedule ids
    by_date: DashMap<NaiveDate, Vec<Ulid>>,
    /// (trainer, class date) → schedule ids
    trainer_day: DashMap<(Ulid, NaiveDate), Vec<Ulid>>,
    /// style → schedule ids
    by_style: DashMap<Ulid, Vec<Ulid>>,
    accounts: DashMap<Ulid, Account>,
    styles: DashMap<Ulid, DanceStyle>,
    trainers: DashMap<Ulid, Trainer>,
    /// account id → trainer profile id
    user_to_trainer: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn push_index<K: std::hash::Hash + Eq>(map: &DashMap<K, Vec<Ulid>>, key: K, id: Ulid) {
    map.entry(key).or_default().push(id);
}

fn drop_index<K: std::hash::Hash + Eq>(map: &DashMap<K, Vec<Ulid>>, key: &K, id: &Ulid) {
    let now_empty = match map.get_mut(key) {
        Some(mut ids) => {
            ids.retain(|x| x != id);
            ids.is_empty()
        }
        None => false,
    };
    if now_empty {
        map.remove_if(key, |_, ids| ids.is_empty());
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            schedules: DashMap::new(),
            booking_index: DashMap::new(),
            client_index: DashMap::new(),
            by_date: DashMap::new(),
            trainer_day: DashMap::new(),
            by_style: DashMap::new(),
            accounts: DashMap::new(),
            styles: DashMap::new(),
            trainers: DashMap::new(),
            user_to_trainer: DashMap::new(),
        }
    }

    // ── Accounts and roles ───────────────────────────────────

    pub fn account(&self, id: &Ulid) -> Option<Account> {
        self.accounts.get(id).map(|e| e.value().clone())
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn contains_account(&self, id: &Ulid) -> bool {
        self.accounts.contains_key(id)
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.iter().map(|e| e.value().clone()).collect()
    }

    /// Unknown ids resolve to a principal with no role.
    pub fn principal(&self, account_id: Ulid) -> Principal {
        match self.accounts.get(&account_id) {
            Some(acc) => Principal {
                account_id,
                role: Some(acc.role),
                is_staff: acc.is_staff,
                trainer_id: self.user_to_trainer.get(&account_id).map(|t| *t.value()),
            },
            None => Principal::anonymous(account_id),
        }
    }

    // ── Styles and trainers ──────────────────────────────────

    pub fn style(&self, id: &Ulid) -> Option<DanceStyle> {
        self.styles.get(id).map(|e| e.value().clone())
    }

    pub fn contains_style(&self, id: &Ulid) -> bool {
        self.styles.contains_key(id)
    }

    pub fn style_count(&self) -> usize {
        self.styles.len()
    }

    pub fn styles(&self) -> Vec<DanceStyle> {
        self.styles.iter().map(|e| e.value().clone()).collect()
    }

    /// Any schedule or trainer still pointing at this style.
    pub fn style_in_use(&self, id: &Ulid) -> bool {
        self.by_style.get(id).is_some_and(|ids| !ids.is_empty())
            || self.trainers.iter().any(|t| t.styles.contains(id))
    }

    pub fn trainer(&self, id: &Ulid) -> Option<Trainer> {
        self.trainers.get(id).map(|e| e.value().clone())
    }

    pub fn contains_trainer(&self, id: &Ulid) -> bool {
        self.trainers.contains_key(id)
    }

    pub fn trainer_count(&self) -> usize {
        self.trainers.len()
    }

    pub fn trainers(&self) -> Vec<Trainer> {
        self.trainers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn trainer_for_user(&self, user_id: &Ulid) -> Option<Ulid> {
        self.user_to_trainer.get(user_id).map(|e| *e.value())
    }

    // ── Schedule cells ───────────────────────────────────────

    pub fn schedule_count(&self) -> usize {
        self.schedules.len()
    }

    pub fn contains_schedule(&self, id: &Ulid) -> bool {
        self.schedules.contains_key(id)
    }

    pub fn get_schedule(&self, id: &Ulid) -> Option<SharedScheduleState> {
        self.schedules.get(id).map(|e| e.value().clone())
    }

    pub fn schedule_ids(&self) -> Vec<Ulid> {
        self.schedules.iter().map(|e| *e.key()).collect()
    }

    pub fn schedule_ids_on(&self, date: &NaiveDate) -> Vec<Ulid> {
        self.by_date
            .get(date)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn trainer_schedules_on(&self, trainer: Ulid, date: NaiveDate) -> Vec<Ulid> {
        self.trainer_day
            .get(&(trainer, date))
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn insert_schedule(&self, entry: ScheduleEntry) {
        self.index_entry(&entry);
        let id = entry.id;
        self.schedules
            .insert(id, Arc::new(RwLock::new(ScheduleState::new(entry))));
    }

    /// Unlink a schedule and everything booked on it. The caller holds the
    /// cell's write lock; anyone queued behind it sees `removed`.
    pub fn remove_schedule(&self, ss: &mut ScheduleState) -> usize {
        self.unindex_entry(&ss.entry);
        for booking in &ss.bookings {
            self.booking_index.remove(&booking.id);
            drop_index(&self.client_index, &booking.client_id, &booking.id);
        }
        let cascaded = ss.bookings.len();
        ss.bookings.clear();
        ss.removed = true;
        self.schedules.remove(&ss.entry.id);
        cascaded
    }

    fn index_entry(&self, entry: &ScheduleEntry) {
        push_index(&self.by_date, entry.class_date, entry.id);
        push_index(&self.trainer_day, (entry.trainer, entry.class_date), entry.id);
        push_index(&self.by_style, entry.dance_style, entry.id);
    }

    fn unindex_entry(&self, entry: &ScheduleEntry) {
        drop_index(&self.by_date, &entry.class_date, &entry.id);
        drop_index(&self.trainer_day, &(entry.trainer, entry.class_date), &entry.id);
        drop_index(&self.by_style, &entry.dance_style, &entry.id);
    }

    // ── Booking index ────────────────────────────────────────

    /// Claim `booking_id` for a booking about to land on `schedule_id`.
    /// False if any booking, pending or stored, already holds the id.
    pub fn reserve_booking_id(&self, booking_id: Ulid, schedule_id: Ulid) -> bool {
        match self.booking_index.entry(booking_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(schedule_id);
                true
            }
        }
    }

    /// Undo a claim whose booking never landed.
    pub fn release_booking_id(&self, booking_id: &Ulid, schedule_id: &Ulid) {
        self.booking_index
            .remove_if(booking_id, |_, claimed| claimed == schedule_id);
    }

    pub fn schedule_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    pub fn client_booking_ids(&self, client_id: &Ulid) -> Vec<Ulid> {
        self.client_index
            .get(client_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Event application ────────────────────────────────────

    /// Catalog events touch no schedule cell and need no lock.
    pub fn apply_catalog_event(&self, event: &Event) {
        match event {
            Event::AccountCreated { account } => {
                self.accounts.insert(account.id, account.clone());
            }
            Event::StyleCreated { style } | Event::StyleUpdated { style } => {
                self.styles.insert(style.id, style.clone());
            }
            Event::StyleDeleted { id } => {
                self.styles.remove(id);
            }
            Event::TrainerCreated { trainer } => {
                self.user_to_trainer.insert(trainer.user_id, trainer.id);
                self.trainers.insert(trainer.id, trainer.clone());
            }
            Event::TrainerStylesSet { id, styles } => {
                if let Some(mut t) = self.trainers.get_mut(id) {
                    t.styles = styles.clone();
                }
            }
            Event::ScheduleCreated { entry } => self.insert_schedule(entry.clone()),
            Event::SchedulesCreated { entries } => {
                for entry in entries {
                    self.insert_schedule(entry.clone());
                }
            }
            // Cell-level events go through apply_schedule_event
            Event::ScheduleUpdated { .. }
            | Event::ScheduleDeleted { .. }
            | Event::BookingCreated { .. }
            | Event::BookingsTransitioned { .. } => {}
        }
    }

    /// Apply a cell-level event. No locking here; the caller holds the
    /// cell's write lock.
    pub fn apply_schedule_event(&self, ss: &mut ScheduleState, event: &Event) {
        match event {
            Event::ScheduleUpdated { entry } => {
                self.unindex_entry(&ss.entry);
                self.index_entry(entry);
                ss.entry = entry.clone();
            }
            Event::ScheduleDeleted { .. } => {
                self.remove_schedule(ss);
            }
            Event::BookingCreated { booking } => {
                self.booking_index.insert(booking.id, booking.schedule_id);
                push_index(&self.client_index, booking.client_id, booking.id);
                ss.bookings.push(booking.clone());
            }
            Event::BookingsTransitioned { ids, status, .. } => {
                ss.transition(ids, *status);
            }
            _ => {}
        }
    }
}

/// Schedule id a cell-level event belongs to.
pub(super) fn event_schedule_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ScheduleUpdated { entry } => Some(entry.id),
        Event::ScheduleDeleted { id } => Some(*id),
        Event::BookingCreated { booking } => Some(booking.schedule_id),
        Event::BookingsTransitioned { schedule_id, .. } => Some(*schedule_id),
        Event::AccountCreated { .. }
        | Event::StyleCreated { .. }
        | Event::StyleUpdated { .. }
        | Event::StyleDeleted { .. }
        | Event::TrainerCreated { .. }
        | Event::TrainerStylesSet { .. }
        | Event::ScheduleCreated { .. }
        | Event::SchedulesCreated { .. } => None,
    }
}
