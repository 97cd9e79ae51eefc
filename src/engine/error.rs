use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug)]
pub enum EngineError {
    NotClient,
    NotTrainer,
    NotAdmin,
    ScheduleNotFound(Ulid),
    BookingNotFound(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    ScheduleInactive(Ulid),
    ClassAlreadyStarted(Ulid),
    ClassNotStarted(Ulid),
    AlreadyBooked(Ulid),
    ClassFull(u32),
    /// The schedule went away while we waited on its lock.
    ConcurrencyConflict(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    InvalidTimeRange,
    DurationOutOfRange(Ms),
    TrainerConflict(Ulid),
    InvalidCapacity(u32),
    CapacityBelowBooked {
        requested: u32,
        booked: u32,
    },
    StyleInUse(Ulid),
    InvalidRole(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Only a lost race is worth retrying; everything else will fail the
    /// same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotClient => write!(f, "only clients can book classes"),
            EngineError::NotTrainer => write!(f, "not the trainer of this class"),
            EngineError::NotAdmin => write!(f, "administrator rights required"),
            EngineError::ScheduleNotFound(id) => write!(f, "schedule not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::ScheduleInactive(id) => write!(f, "class {id} is not active"),
            EngineError::ClassAlreadyStarted(id) => {
                write!(f, "class {id} has already started")
            }
            EngineError::ClassNotStarted(id) => write!(f, "class {id} has not started yet"),
            EngineError::AlreadyBooked(id) => write!(f, "already booked for class {id}"),
            EngineError::ClassFull(max) => {
                write!(f, "class is full: all {max} places taken")
            }
            EngineError::ConcurrencyConflict(id) => {
                write!(f, "schedule {id} changed concurrently, retry")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move booking from {from} to {to}")
            }
            EngineError::InvalidTimeRange => write!(f, "start time must be before end time"),
            EngineError::DurationOutOfRange(ms) => {
                write!(f, "class duration {} min is outside 60..=300 min", ms / 60_000)
            }
            EngineError::TrainerConflict(id) => {
                write!(f, "trainer already teaches overlapping class {id}")
            }
            EngineError::InvalidCapacity(n) => write!(f, "invalid max_participants: {n}"),
            EngineError::CapacityBelowBooked { requested, booked } => write!(
                f,
                "max_participants {requested} is below the {booked} places already booked"
            ),
            EngineError::StyleInUse(id) => write!(f, "dance style {id} is still in use"),
            EngineError::InvalidRole(id) => write!(f, "account {id} has the wrong role"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
