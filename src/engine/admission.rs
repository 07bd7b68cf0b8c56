use crate::model::*;

use super::error::ConflictReason;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// At most one booking per (room, user) may still be running at `now`,
/// regardless of whether the new span overlaps it.
pub(crate) fn check_no_active_duplicate(
    room: &RoomState,
    user_id: UserId,
    now: Ms,
) -> Result<(), EngineError> {
    if room.count_active_for_user(user_id, now) > 0 {
        return Err(EngineError::Conflict(ConflictReason::DuplicateActiveBooking));
    }
    Ok(())
}

/// Every booking overlapping `span` counts against capacity, whether or not
/// those bookings overlap each other.
pub(crate) fn check_capacity(room: &RoomState, span: &Span) -> Result<(), EngineError> {
    let overlapping = room.count_overlapping(span);
    if overlapping >= room.capacity as usize {
        return Err(EngineError::Conflict(ConflictReason::CapacityExceeded {
            capacity: room.capacity,
        }));
    }
    Ok(())
}

/// Both admission checks against one snapshot and one instant.
/// The duplicate check runs first so it wins when both would fail.
pub(crate) fn admit(room: &RoomState, user_id: UserId, span: &Span, now: Ms) -> Result<(), EngineError> {
    check_no_active_duplicate(room, user_id, now)?;
    check_capacity(room, span)
}
