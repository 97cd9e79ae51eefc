//! Capability checks. Every predicate denies when role data is missing.

use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Role, ScheduleEntry};

/// Who is calling, as far as the gate is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub account_id: Ulid,
    /// `None` for unknown accounts.
    pub role: Option<Role>,
    pub is_staff: bool,
    /// Trainer profile backed by this account, if any.
    pub trainer_id: Option<Ulid>,
}

impl Principal {
    pub fn anonymous(account_id: Ulid) -> Self {
        Self {
            account_id,
            role: None,
            is_staff: false,
            trainer_id: None,
        }
    }
}

pub fn can_book(p: &Principal) -> bool {
    p.role == Some(Role::Client)
}

pub fn can_manage_schedule(p: &Principal, entry: &ScheduleEntry) -> bool {
    p.role == Some(Role::Trainer) && p.trainer_id == Some(entry.trainer)
}

/// Staff flag only counts on a known account.
pub fn is_admin(p: &Principal) -> bool {
    match p.role {
        Some(Role::Admin) => true,
        Some(_) => p.is_staff,
        None => false,
    }
}

pub fn require_client(p: &Principal) -> Result<(), EngineError> {
    if can_book(p) {
        Ok(())
    } else {
        Err(EngineError::NotClient)
    }
}

pub fn require_trainer_of(p: &Principal, entry: &ScheduleEntry) -> Result<(), EngineError> {
    if can_manage_schedule(p, entry) {
        Ok(())
    } else {
        Err(EngineError::NotTrainer)
    }
}

pub fn require_admin(p: &Principal) -> Result<(), EngineError> {
    if is_admin(p) {
        Ok(())
    } else {
        Err(EngineError::NotAdmin)
    }
}
