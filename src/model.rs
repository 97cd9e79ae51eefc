use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant in the engine uses this.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── People ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    Trainer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Trainer => "trainer",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "trainer" => Ok(Role::Trainer),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Ulid,
    pub role: Role,
    pub name: String,
    /// Staff accounts get admin capabilities regardless of role.
    pub is_staff: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanceStyle {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    pub image: Option<String>,
}

/// Trainer profile. One-to-one with an account whose role is `Trainer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trainer {
    pub id: Ulid,
    pub user_id: Ulid,
    pub bio: String,
    pub photo: Option<String>,
    pub styles: Vec<Ulid>,
}

// ── Schedule ─────────────────────────────────────────────────────

/// One class on one concrete date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Ulid,
    pub class_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub dance_style: Ulid,
    pub trainer: Ulid,
    pub max_participants: u32,
    pub is_active: bool,
}

impl ScheduleEntry {
    /// Always derived from `class_date`; there is no stored copy to drift.
    pub fn day_of_week(&self) -> Weekday {
        self.class_date.weekday()
    }

    pub fn duration_ms(&self) -> Ms {
        (self.end_time - self.start_time).num_milliseconds()
    }

    /// Same date and `[start, end)` intersect.
    pub fn overlaps(&self, other: &ScheduleEntry) -> bool {
        self.class_date == other.class_date
            && self.start_time < other.end_time
            && self.end_time > other.start_time
    }
}

/// Partial update for a schedule entry. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulePatch {
    pub class_date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub dance_style: Option<Ulid>,
    pub trainer: Option<Ulid>,
    pub max_participants: Option<u32>,
    pub is_active: Option<bool>,
}

impl SchedulePatch {
    pub fn apply(&self, entry: &ScheduleEntry) -> ScheduleEntry {
        ScheduleEntry {
            id: entry.id,
            class_date: self.class_date.unwrap_or(entry.class_date),
            start_time: self.start_time.unwrap_or(entry.start_time),
            end_time: self.end_time.unwrap_or(entry.end_time),
            dance_style: self.dance_style.unwrap_or(entry.dance_style),
            trainer: self.trainer.unwrap_or(entry.trainer),
            max_participants: self.max_participants.unwrap_or(entry.max_participants),
            is_active: self.is_active.unwrap_or(entry.is_active),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StylePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<Option<String>>,
}

impl StylePatch {
    pub fn apply(&self, style: &DanceStyle) -> DanceStyle {
        DanceStyle {
            id: style.id,
            name: self.name.clone().unwrap_or_else(|| style.name.clone()),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| style.description.clone()),
            image: self.image.clone().unwrap_or_else(|| style.image.clone()),
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Booked,
    Attended,
    Missed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Booked => "booked",
            BookingStatus::Attended => "attended",
            BookingStatus::Missed => "missed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BookingStatus::Booked)
    }

    /// `booked` moves to any terminal state; terminal states never move.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        *self == BookingStatus::Booked && next.is_terminal()
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "booked" => Ok(BookingStatus::Booked),
            "attended" => Ok(BookingStatus::Attended),
            "missed" => Ok(BookingStatus::Missed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub client_id: Ulid,
    pub schedule_id: Ulid,
    /// Fixed at creation from the schedule's date.
    pub class_date: NaiveDate,
    /// Creation instant. Never rewritten.
    pub booking_date: Ms,
    pub status: BookingStatus,
}

/// A schedule entry together with every booking made against it.
/// The unit of locking: all capacity and uniqueness checks for a class
/// happen under this cell's write lock.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub entry: ScheduleEntry,
    /// Insertion order.
    pub bookings: Vec<Booking>,
    /// Set when the entry is deleted while someone is waiting on the lock.
    pub removed: bool,
}

impl ScheduleState {
    pub fn new(entry: ScheduleEntry) -> Self {
        Self {
            entry,
            bookings: Vec::new(),
            removed: false,
        }
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_for_client(&self, client_id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.client_id == *client_id)
    }

    pub fn ids_with_status(&self, status: BookingStatus) -> Vec<Ulid> {
        self.bookings
            .iter()
            .filter(|b| b.status == status)
            .map(|b| b.id)
            .collect()
    }

    /// Set `status` on the listed bookings. Returns how many changed.
    pub fn transition(&mut self, ids: &[Ulid], status: BookingStatus) -> usize {
        let mut changed = 0;
        for booking in self.bookings.iter_mut() {
            if ids.contains(&booking.id) && booking.status.can_transition_to(status) {
                booking.status = status;
                changed += 1;
            }
        }
        changed
    }
}

/// One durable state change. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AccountCreated {
        account: Account,
    },
    StyleCreated {
        style: DanceStyle,
    },
    StyleUpdated {
        style: DanceStyle,
    },
    StyleDeleted {
        id: Ulid,
    },
    TrainerCreated {
        trainer: Trainer,
    },
    TrainerStylesSet {
        id: Ulid,
        styles: Vec<Ulid>,
    },
    ScheduleCreated {
        entry: ScheduleEntry,
    },
    /// Materialized recurrence. One record, so all-or-nothing.
    SchedulesCreated {
        entries: Vec<ScheduleEntry>,
    },
    ScheduleUpdated {
        entry: ScheduleEntry,
    },
    ScheduleDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Bulk status change on one schedule. One record, so all-or-nothing.
    BookingsTransitioned {
        schedule_id: Ulid,
        ids: Vec<Ulid>,
        status: BookingStatus,
    },
}

// ── Query result types ───────────────────────────────────────────

/// An occurrence as shown to someone browsing the timetable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccurrenceView {
    pub entry: ScheduleEntry,
    pub date: NaiveDate,
    pub span: Span,
    pub taken: u32,
    pub available: u32,
    pub is_past: bool,
    pub is_today: bool,
    pub is_future: bool,
    pub booking_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub entry: ScheduleEntry,
    pub class_start: Ms,
    /// What the status will be once the sweep catches up. Differs from
    /// `booking.status` only for `booked` records past the sweep cutoff.
    pub effective_status: BookingStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingStats {
    pub booked: usize,
    pub attended: usize,
    pub missed: usize,
    pub cancelled: usize,
    pub total_history: usize,
    /// attended / total_history, 0.0 when there is no history.
    pub attendance_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientBookings {
    /// Still `booked` and not yet swept, ordered by class start ascending.
    /// Includes a class that has started but is inside the missed grace.
    pub active: Vec<BookingView>,
    /// Everything else, newest booking first.
    pub history: Vec<BookingView>,
    pub stats: BookingStats,
}
