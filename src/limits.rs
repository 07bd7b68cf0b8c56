//! Hard caps on state size. Anything over these is rejected with
//! `EngineError::LimitExceeded` before it reaches the WAL.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_USERS: usize = 100_000;
/// Counts only bookings that have not ended; history never fills a room.
pub const MAX_BOOKINGS_PER_ROOM: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LOCATION_LEN: usize = 256;
pub const MAX_AMENITIES_LEN: usize = 1024;
pub const MAX_PURPOSE_LEN: usize = 1024;
pub const MAX_EMAIL_LEN: usize = 320;

/// Listing defaults to the first 100 rows.
pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;
