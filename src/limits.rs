//! Hard input limits. Anything beyond these is rejected with
//! `EngineError::LimitExceeded` before it reaches the WAL.

use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_TEXT_LEN: usize = 4_000;
pub const MAX_ACCOUNTS: usize = 1_000_000;
pub const MAX_STYLES: usize = 10_000;
pub const MAX_TRAINERS: usize = 10_000;
pub const MAX_STYLES_PER_TRAINER: usize = 64;
pub const MAX_SCHEDULES: usize = 1_000_000;

/// Upper bound on `max_participants` for a single class.
pub const MAX_PARTICIPANTS: u32 = 1_000;

/// Widest window `occurrences_in_range` will project, in days.
pub const MAX_QUERY_DAYS: i64 = 366;

/// Most per-date entries one recurrence rule may materialize.
pub const MAX_RECURRENCE_DATES: usize = 260;

pub const MIN_CLASS_DURATION_MS: Ms = 3_600_000;
pub const MAX_CLASS_DURATION_MS: Ms = 5 * 3_600_000;
