use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type RoomId = Ulid;
pub type UserId = Ulid;
pub type BookingId = Ulid;

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

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Still running (or not yet started) at `now`.
    pub fn is_active_at(&self, now: Ms) -> bool {
        self.end > now
    }
}

/// A stored reservation. Never mutated after admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub span: Span,
    pub purpose: String,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Admission order across every room. Listings sort by it.
    pub seq: u64,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: RoomId,
    pub name: String,
    /// Max bookings whose windows may overlap a new one.
    pub capacity: u32,
    pub location: String,
    pub amenities: String,
    pub active: bool,
    /// All bookings for this room, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(id: RoomId, name: String, capacity: u32, location: String, amenities: String) -> Self {
        Self {
            id,
            name,
            capacity,
            location,
            amenities,
            active: true,
            bookings: Vec::new(),
        }
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            location: self.location.clone(),
            amenities: self.amenities.clone(),
            active: self.active,
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn count_overlapping(&self, query: &Span) -> usize {
        self.overlapping(query).count()
    }

    /// Bookings held by `user_id` that have not ended by `now`.
    pub fn count_active_for_user(&self, user_id: UserId, now: Ms) -> usize {
        self.bookings
            .iter()
            .filter(|b| b.user_id == user_id && b.span.is_active_at(now))
            .count()
    }

    /// Bookings that have not ended by `now`, whoever holds them.
    pub fn count_active(&self, now: Ms) -> usize {
        self.bookings.iter().filter(|b| b.span.is_active_at(now)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub is_admin: bool,
    pub is_active: bool,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: RoomId,
        name: String,
        capacity: u32,
        location: String,
        amenities: String,
    },
    RoomUpdated {
        id: RoomId,
        name: String,
        capacity: u32,
        location: String,
        amenities: String,
    },
    RoomActiveSet {
        id: RoomId,
        active: bool,
    },
    UserRegistered {
        id: UserId,
        email: String,
        name: String,
        is_admin: bool,
    },
    UserActiveSet {
        id: UserId,
        active: bool,
    },
    BookingCreated {
        id: BookingId,
        room_id: RoomId,
        user_id: UserId,
        span: Span,
        purpose: String,
        created_at: Ms,
        seq: u64,
    },
    BookingDeleted {
        id: BookingId,
        room_id: RoomId,
    },
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub id: RoomId,
    pub name: String,
    pub capacity: u32,
    pub location: String,
    pub amenities: String,
}

/// Replacement values for a room's descriptive fields and capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomChanges {
    pub name: String,
    pub capacity: u32,
    pub location: String,
    pub amenities: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: BookingId,
    pub room_id: RoomId,
    pub span: Span,
    pub purpose: String,
}

/// Offset/limit window over a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.min(MAX_PAGE_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub capacity: u32,
    pub location: String,
    pub amenities: String,
    pub active: bool,
}
