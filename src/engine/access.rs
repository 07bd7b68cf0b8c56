use crate::identity::{Capability, Principal};
use crate::model::Booking;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Delete,
}

/// Owners may act on their own bookings; `ManageAllBookings` may act on any.
/// Both actions share the rule.
pub fn authorize(booking: &Booking, principal: &impl Principal, action: Action) -> Result<(), EngineError> {
    if can_see(booking, principal) {
        return Ok(());
    }
    tracing::debug!(
        booking = %booking.id,
        requester = %principal.id(),
        ?action,
        "booking access denied"
    );
    Err(EngineError::Forbidden)
}

/// Listing filter: the same rule as `authorize`, applied without rejecting.
pub fn can_see(booking: &Booking, principal: &impl Principal) -> bool {
    principal.has(Capability::ManageAllBookings) || booking.user_id == principal.id()
}

pub(crate) fn require(principal: &impl Principal, capability: Capability) -> Result<(), EngineError> {
    if principal.has(capability) {
        Ok(())
    } else {
        Err(EngineError::Forbidden)
    }
}
