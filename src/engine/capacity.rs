use crate::model::{BookingStatus, ScheduleState};

/// Seats held by `booked` records. Terminal records free their seat.
pub fn seats_taken(ss: &ScheduleState) -> u32 {
    let n = ss
        .bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Booked)
        .count();
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Never negative, even if capacity was lowered by hand.
pub fn available_slots(ss: &ScheduleState) -> u32 {
    ss.entry.max_participants.saturating_sub(seats_taken(ss))
}

pub fn is_full(ss: &ScheduleState) -> bool {
    available_slots(ss) == 0
}
