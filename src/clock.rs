use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};

use crate::model::Ms;

/// Source of "now". Injected so every time-dependent rule can be driven
/// from a fixed instant in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// The studio's wall clock. Class dates and times are local to the
/// studio; this turns them into instants and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StudioTime {
    offset: FixedOffset,
}

impl Default for StudioTime {
    fn default() -> Self {
        Self::utc()
    }
}

impl StudioTime {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self {
            offset: FixedOffset::east_opt(0).expect("zero offset is valid"),
        }
    }

    /// `None` if the offset is not within ±24h.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .map(Self::new)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local `date` + `time` at the studio, as an instant.
    pub fn combine(&self, date: NaiveDate, time: NaiveTime) -> Ms {
        let local = date.and_time(time);
        local.and_utc().timestamp_millis() - Ms::from(self.offset.local_minus_utc()) * 1000
    }

    /// Calendar date at the studio for the given instant.
    pub fn local_date(&self, t: Ms) -> NaiveDate {
        DateTime::from_timestamp_millis(t)
            .unwrap_or_default()
            .with_timezone(&self.offset)
            .date_naive()
    }
}
