//! Policy constants and hard limits.

/// Shortest stay a resident may request, in calendar months.
pub const MIN_STAY_MONTHS: u32 = 1;

/// Longest stay a resident may request, in calendar months.
pub const MAX_STAY_MONTHS: u32 = 36;

/// A pending request lapses this many hours after it was submitted.
pub const REQUEST_TTL_HOURS: i64 = 24;

/// Stay length assumed for occupancies recorded without an exit date.
pub const LEGACY_STAY_MONTHS: u32 = 12;

/// How many overlapping stays a capacity decision reports back.
pub const MAX_REPORTED_CONFLICTS: usize = 3;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 255;
pub const MAX_LABEL_LEN: usize = 64;
pub const MAX_NOTE_LEN: usize = 500;

pub const MAX_USERS: usize = 1_000_000;
pub const MAX_ROOMS: usize = 100_000;
pub const MAX_ROOM_CAPACITY: u32 = 64;

/// Occupancies + requests retained per room.
pub const MAX_RECORDS_PER_ROOM: usize = 10_000;
