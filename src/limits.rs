//! Hard caps protecting memory and the WAL from unbounded input.

use crate::model::Ms;

pub const MAX_ROOMS_PER_CAMPUS: usize = 10_000;

/// Reservation records (all statuses) plus blocks held per room.
pub const MAX_RECORDS_PER_ROOM: usize = 100_000;
pub const MAX_BLOCKS_PER_ROOM: usize = 1_000;

pub const MAX_ROOM_NUMBER_LEN: usize = 64;
pub const MAX_SUBJECT_LEN: usize = 128;
pub const MAX_SEMESTER_LEN: usize = 32;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A reservation may not span more than one calendar day; the projection
/// check tightens this further to a single wall-clock day.
pub const MAX_SPAN_DURATION_MS: Ms = 86_400_000;

/// Students may reserve at most two hours per request.
pub const STUDENT_MAX_DURATION_MS: Ms = 7_200_000;

/// Availability / room-day queries are bounded to one month.
pub const MAX_QUERY_WINDOW_MS: Ms = 31 * 86_400_000;

/// Bound on the per-room exclusion scope. Lock waits beyond this surface
/// `LockTimeout` and the caller retries from scratch.
pub const LOCK_TIMEOUT_MS: u64 = 5_000;

pub const MAX_CAMPUSES: usize = 256;
pub const MAX_CAMPUS_NAME_LEN: usize = 256;
