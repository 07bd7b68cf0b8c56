use std::fmt;

use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Room,
    Booking,
    User,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Room => "room",
            Entity::Booking => "booking",
            Entity::User => "user",
        })
    }
}

/// Why admission turned a booking away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The requester already holds a booking in this room that has not ended.
    DuplicateActiveBooking,
    /// Overlapping bookings already fill the room.
    CapacityExceeded { capacity: u32 },
}

impl ConflictReason {
    /// Stable machine-readable code, also used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            ConflictReason::DuplicateActiveBooking => "duplicate_active_booking",
            ConflictReason::CapacityExceeded { .. } => "capacity_exceeded",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::DuplicateActiveBooking => {
                write!(f, "you already have an active booking for this room")
            }
            ConflictReason::CapacityExceeded { capacity } => write!(
                f,
                "room is at capacity ({capacity} bookings); cannot create more bookings for this time period"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} not found: {1}")]
    NotFound(Entity, Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("email already registered: {0}")]
    EmailTaken(String),
    #[error("{}: {}", .0.code(), .0)]
    Conflict(ConflictReason),
    #[error("not enough permissions")]
    Forbidden,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
