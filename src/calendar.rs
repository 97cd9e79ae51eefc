//! Calendar projection: turning schedule definitions into dated
//! occurrences.
//!
//! Everything here is pure. The same inputs always produce the same
//! output in the same order, which is what keeps week-by-week browsing
//! and "jump to date" consistent with each other.

use chrono::{Datelike, Days, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::StudioTime;
use crate::model::{Ms, ScheduleEntry, Span};

/// One concrete, dated instance of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub schedule: ScheduleEntry,
    pub date: NaiveDate,
    pub start: Ms,
    pub end: Ms,
}

impl Occurrence {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OccurrenceFilter {
    pub dance_style: Option<Ulid>,
    pub trainer: Option<Ulid>,
}

impl OccurrenceFilter {
    pub fn matches(&self, entry: &ScheduleEntry) -> bool {
        self.dance_style.is_none_or(|s| s == entry.dance_style)
            && self.trainer.is_none_or(|t| t == entry.trainer)
    }
}

/// Active entries dated within `[from, to]`, ordered by
/// `(date, start_time)` with ties kept in id order.
pub fn occurrences_in_range<'a>(
    schedules: impl IntoIterator<Item = &'a ScheduleEntry>,
    from: NaiveDate,
    to: NaiveDate,
    studio: &StudioTime,
) -> Vec<Occurrence> {
    let mut picked: Vec<&ScheduleEntry> = schedules
        .into_iter()
        .filter(|e| e.is_active && e.class_date >= from && e.class_date <= to)
        .collect();
    // id breaks ties so the order is total
    picked.sort_by(|a, b| {
        (a.class_date, a.start_time, a.id).cmp(&(b.class_date, b.start_time, b.id))
    });

    picked
        .into_iter()
        .map(|e| Occurrence {
            schedule: e.clone(),
            date: e.class_date,
            start: studio.combine(e.class_date, e.start_time),
            end: studio.combine(e.class_date, e.end_time),
        })
        .collect()
}

// ── Recurrence ───────────────────────────────────────────────────

/// A weekly class declared once and materialized into per-date entries
/// when created. Never consulted on read paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub day_of_week: Weekday,
    pub start_date: NaiveDate,
    /// Inclusive. `None` means open-ended.
    pub end_date: Option<NaiveDate>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub dance_style: Ulid,
    pub trainer: Ulid,
    pub max_participants: u32,
}

impl RecurrenceRule {
    /// Per-date entry for one expanded date.
    pub fn entry_on(&self, id: Ulid, date: NaiveDate) -> ScheduleEntry {
        ScheduleEntry {
            id,
            class_date: date,
            start_time: self.start_time,
            end_time: self.end_time,
            dance_style: self.dance_style,
            trainer: self.trainer,
            max_participants: self.max_participants,
            is_active: true,
        }
    }
}

/// Every date in `[from, to]` on the rule's weekday that also lies inside
/// the rule's own `[start_date, end_date]` window. Ascending.
pub fn expand_rule(rule: &RecurrenceRule, from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let lo = from.max(rule.start_date);
    let hi = match rule.end_date {
        Some(end) => to.min(end),
        None => to,
    };
    if lo > hi {
        return Vec::new();
    }

    let target = rule.day_of_week.num_days_from_monday();
    let current = lo.weekday().num_days_from_monday();
    let skip = (7 + target - current) % 7;

    let mut dates = Vec::new();
    let mut next = lo.checked_add_days(Days::new(u64::from(skip)));
    while let Some(date) = next {
        if date > hi {
            break;
        }
        dates.push(date);
        next = date.checked_add_days(Days::new(7));
    }
    dates
}

/// Weekday from the 0 = Monday .. 6 = Sunday numbering the studio uses.
pub fn weekday_from_index(index: u32) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}
