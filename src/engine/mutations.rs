use chrono::{Days, NaiveDate};
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::calendar::{expand_rule, RecurrenceRule};
use crate::limits::*;
use crate::model::*;
use crate::roles::require_admin;

use super::capacity::seats_taken;
use super::conflict::{
    check_fresh_id, check_references, check_trainer_free, validate_entry, validate_name,
    validate_text,
};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Accounts ─────────────────────────────────────────────

    pub async fn create_account(&self, admin: Ulid, account: Account) -> Result<(), EngineError> {
        require_admin(&self.principal(admin))?;
        let _catalog = self.catalog_lock.lock().await;
        self.insert_account(account).await
    }

    /// Bootstrap: make sure `id` exists as an admin account. Returns
    /// whether it had to be created.
    pub async fn ensure_admin(&self, id: Ulid, name: &str) -> Result<bool, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if let Some(existing) = self.store.account(&id) {
            if existing.role != Role::Admin && !existing.is_staff {
                return Err(EngineError::InvalidRole(id));
            }
            return Ok(false);
        }
        self.insert_account(Account {
            id,
            role: Role::Admin,
            name: name.to_string(),
            is_staff: true,
        })
        .await?;
        Ok(true)
    }

    async fn insert_account(&self, account: Account) -> Result<(), EngineError> {
        validate_name(&account.name)?;
        if self.store.account_count() >= MAX_ACCOUNTS {
            return Err(EngineError::LimitExceeded("too many accounts"));
        }
        check_fresh_id(&self.store, &account.id)?;
        let id = account.id;
        let role = account.role;
        self.persist_catalog(&Event::AccountCreated { account }).await?;
        info!("account {id} created as {}", role.as_str());
        Ok(())
    }

    // ── Dance styles ─────────────────────────────────────────

    pub async fn create_style(&self, admin: Ulid, style: DanceStyle) -> Result<(), EngineError> {
        require_admin(&self.principal(admin))?;
        validate_style(&style)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.store.style_count() >= MAX_STYLES {
            return Err(EngineError::LimitExceeded("too many dance styles"));
        }
        check_fresh_id(&self.store, &style.id)?;
        self.persist_catalog(&Event::StyleCreated { style }).await
    }

    pub async fn update_style(
        &self,
        admin: Ulid,
        id: Ulid,
        patch: StylePatch,
    ) -> Result<DanceStyle, EngineError> {
        require_admin(&self.principal(admin))?;
        let _catalog = self.catalog_lock.lock().await;
        let current = self.store.style(&id).ok_or(EngineError::NotFound(id))?;
        let style = patch.apply(&current);
        validate_style(&style)?;
        self.persist_catalog(&Event::StyleUpdated {
            style: style.clone(),
        })
        .await?;
        Ok(style)
    }

    /// Refused while any schedule or trainer still references the style.
    pub async fn delete_style(&self, admin: Ulid, id: Ulid) -> Result<(), EngineError> {
        require_admin(&self.principal(admin))?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.store.contains_style(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.store.style_in_use(&id) {
            return Err(EngineError::StyleInUse(id));
        }
        self.persist_catalog(&Event::StyleDeleted { id }).await?;
        info!("dance style {id} deleted");
        Ok(())
    }

    // ── Trainers ─────────────────────────────────────────────

    /// The backing account must have the trainer role and may back only
    /// one profile.
    pub async fn create_trainer(&self, admin: Ulid, trainer: Trainer) -> Result<(), EngineError> {
        require_admin(&self.principal(admin))?;
        validate_text(&trainer.bio, MAX_TEXT_LEN, "bio too long")?;
        if let Some(photo) = &trainer.photo {
            validate_text(photo, MAX_TEXT_LEN, "photo reference too long")?;
        }
        let _catalog = self.catalog_lock.lock().await;
        if self.store.trainer_count() >= MAX_TRAINERS {
            return Err(EngineError::LimitExceeded("too many trainers"));
        }
        check_fresh_id(&self.store, &trainer.id)?;
        let account = self
            .store
            .account(&trainer.user_id)
            .ok_or(EngineError::NotFound(trainer.user_id))?;
        if account.role != Role::Trainer {
            return Err(EngineError::InvalidRole(trainer.user_id));
        }
        if self.store.trainer_for_user(&trainer.user_id).is_some() {
            return Err(EngineError::AlreadyExists(trainer.user_id));
        }
        let styles = self.checked_styles(trainer.styles)?;
        let trainer = Trainer { styles, ..trainer };
        let id = trainer.id;
        self.persist_catalog(&Event::TrainerCreated { trainer }).await?;
        info!("trainer {id} created");
        Ok(())
    }

    pub async fn set_trainer_styles(
        &self,
        admin: Ulid,
        id: Ulid,
        styles: Vec<Ulid>,
    ) -> Result<(), EngineError> {
        require_admin(&self.principal(admin))?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.store.contains_trainer(&id) {
            return Err(EngineError::NotFound(id));
        }
        let styles = self.checked_styles(styles)?;
        self.persist_catalog(&Event::TrainerStylesSet { id, styles }).await
    }

    /// Dedup, bound, and require every style to exist.
    fn checked_styles(&self, mut styles: Vec<Ulid>) -> Result<Vec<Ulid>, EngineError> {
        styles.sort();
        styles.dedup();
        if styles.len() > MAX_STYLES_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many styles for one trainer"));
        }
        if let Some(missing) = styles.iter().find(|s| !self.store.contains_style(s)) {
            return Err(EngineError::NotFound(*missing));
        }
        Ok(styles)
    }

    // ── Schedule entries ─────────────────────────────────────

    pub async fn create_schedule(&self, admin: Ulid, entry: ScheduleEntry) -> Result<(), EngineError> {
        require_admin(&self.principal(admin))?;
        validate_entry(&entry)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.store.schedule_count() >= MAX_SCHEDULES {
            return Err(EngineError::LimitExceeded("too many schedule entries"));
        }
        check_fresh_id(&self.store, &entry.id)?;
        check_references(&self.store, &entry)?;
        check_trainer_free(&self.store, &entry).await?;
        let id = entry.id;
        self.persist_catalog(&Event::ScheduleCreated { entry }).await?;
        info!("schedule {id} created");
        Ok(())
    }

    /// Apply `patch` to an entry. Re-validates the whole entry, and refuses
    /// to drop capacity below the seats already booked.
    pub async fn update_schedule(
        &self,
        admin: Ulid,
        id: Ulid,
        patch: SchedulePatch,
    ) -> Result<ScheduleEntry, EngineError> {
        require_admin(&self.principal(admin))?;
        let _catalog = self.catalog_lock.lock().await;
        let mut guard = self.schedule_write(id).await.map_err(|e| match e {
            EngineError::ConcurrencyConflict(id) => EngineError::ScheduleNotFound(id),
            other => other,
        })?;

        let updated = patch.apply(&guard.entry);
        validate_entry(&updated)?;
        check_references(&self.store, &updated)?;
        let booked = seats_taken(&guard);
        if updated.max_participants < booked {
            return Err(EngineError::CapacityBelowBooked {
                requested: updated.max_participants,
                booked,
            });
        }
        check_trainer_free(&self.store, &updated).await?;

        let event = Event::ScheduleUpdated {
            entry: updated.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("schedule {id} updated");
        Ok(updated)
    }

    /// Deletes the entry and every booking made on it. Returns how many
    /// bookings went with it.
    pub async fn delete_schedule(&self, admin: Ulid, id: Ulid) -> Result<usize, EngineError> {
        require_admin(&self.principal(admin))?;
        let _catalog = self.catalog_lock.lock().await;
        let mut guard = self.schedule_write(id).await.map_err(|e| match e {
            EngineError::ConcurrencyConflict(id) => EngineError::ScheduleNotFound(id),
            other => other,
        })?;
        let cascaded = guard.bookings.len();
        self.persist_and_apply(&mut guard, &Event::ScheduleDeleted { id })
            .await?;
        info!("schedule {id} deleted with {cascaded} bookings");
        Ok(cascaded)
    }

    /// Expand a weekly rule into one entry per date and commit them all, or
    /// none. An open-ended rule stops at `until`, or after the most dates
    /// one rule may produce.
    pub async fn create_recurring_schedules(
        &self,
        admin: Ulid,
        rule: RecurrenceRule,
        until: Option<NaiveDate>,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        require_admin(&self.principal(admin))?;

        let horizon = rule
            .start_date
            .checked_add_days(Days::new(7 * MAX_RECURRENCE_DATES as u64))
            .ok_or(EngineError::LimitExceeded("recurrence runs past the calendar"))?;
        let to = match (rule.end_date, until) {
            (Some(end), Some(u)) => end.min(u),
            (Some(end), None) => end,
            (None, Some(u)) => u,
            (None, None) => horizon,
        };
        let dates = expand_rule(&rule, rule.start_date, to);
        if dates.len() > MAX_RECURRENCE_DATES {
            return Err(EngineError::LimitExceeded("recurrence produces too many dates"));
        }
        if dates.is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<ScheduleEntry> = dates
            .into_iter()
            .map(|date| rule.entry_on(Ulid::new(), date))
            .collect();
        // every entry shares the rule's times and capacity
        validate_entry(&entries[0])?;

        let _catalog = self.catalog_lock.lock().await;
        if self.store.schedule_count() + entries.len() > MAX_SCHEDULES {
            return Err(EngineError::LimitExceeded("too many schedule entries"));
        }
        check_references(&self.store, &entries[0])?;
        for entry in &entries {
            check_trainer_free(&self.store, entry).await?;
        }

        let event = Event::SchedulesCreated {
            entries: entries.clone(),
        };
        self.persist_catalog(&event).await?;
        info!(
            "materialized {} weekly classes on {:?} from {}",
            entries.len(),
            rule.day_of_week,
            rule.start_date
        );
        Ok(entries)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event set for the current state.
    ///
    /// Holds the catalog lock and a read lock on every schedule until the
    /// new file is in place, so nothing can land in the old log after the
    /// snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut events = Vec::new();
        for account in self.store.accounts() {
            events.push(Event::AccountCreated { account });
        }
        for style in self.store.styles() {
            events.push(Event::StyleCreated { style });
        }
        for trainer in self.store.trainers() {
            events.push(Event::TrainerCreated { trainer });
        }

        let mut held = Vec::new();
        for id in self.store.schedule_ids() {
            let Some(cell) = self.store.get_schedule(&id) else {
                continue;
            };
            let guard = cell.read_owned().await;
            if guard.removed {
                continue;
            }
            events.push(Event::ScheduleCreated {
                entry: guard.entry.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
            held.push(guard);
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(held);
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn validate_style(style: &DanceStyle) -> Result<(), EngineError> {
    validate_name(&style.name)?;
    validate_text(&style.description, MAX_TEXT_LEN, "description too long")?;
    if let Some(image) = &style.image {
        validate_text(image, MAX_TEXT_LEN, "image reference too long")?;
    }
    Ok(())
}
