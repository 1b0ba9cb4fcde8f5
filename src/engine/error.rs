use ulid::Ulid;

use crate::model::{ClassBlock, Ms, Reservation, Span};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// End at or before start, or the interval leaves its wall-clock day.
    InvalidInterval(Span),
    /// Student request longer than the student cap.
    DurationExceeded { limit_ms: Ms, got_ms: Ms },
    /// The interval overlaps the recurring class calendar. Unconditional,
    /// for every role.
    BaseScheduleConflict { blocks: Vec<ClassBlock> },
    /// A teacher's conflict set contains a teacher- or admin-owned
    /// reservation; nothing is overridden.
    BlockedByEqualOrHigher { conflicts: Vec<Reservation> },
    /// A student hit a non-empty conflict set.
    Blocked { conflicts: Vec<Reservation> },
    /// Cancel on a record already cancelled or overridden.
    AlreadyTerminal(Ulid),
    /// Caller is neither the owner nor an admin.
    AccessDenied(Ulid),
    /// A room with confirmed reservations cannot be deregistered.
    RoomInUse(Ulid),
    /// The per-room exclusion scope was not acquired within its bound.
    /// Retry the whole call; the conflict set may have changed.
    LockTimeout(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Wire-facing conflict tag, present for the contested outcomes only.
    pub fn conflict_type(&self) -> Option<&'static str> {
        match self {
            EngineError::BaseScheduleConflict { .. } => Some("base_schedule"),
            EngineError::BlockedByEqualOrHigher { .. } => Some("teacher_or_admin"),
            EngineError::Blocked { .. } => Some("student_blocked"),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInterval(span) => {
                write!(f, "invalid interval: [{}, {})", span.start, span.end)
            }
            EngineError::DurationExceeded { limit_ms, got_ms } => {
                write!(
                    f,
                    "students can book at most {limit_ms}ms, requested {got_ms}ms"
                )
            }
            EngineError::BaseScheduleConflict { blocks } => {
                write!(f, "room occupied by official class ({} block", blocks.len())?;
                if blocks.len() != 1 {
                    write!(f, "s")?;
                }
                write!(f, ")")
            }
            EngineError::BlockedByEqualOrHigher { conflicts } => {
                write!(
                    f,
                    "room already booked by teacher or admin ({} conflict",
                    conflicts.len()
                )?;
                if conflicts.len() != 1 {
                    write!(f, "s")?;
                }
                write!(f, ")")
            }
            EngineError::Blocked { conflicts } => {
                write!(f, "room already booked ({} conflict", conflicts.len())?;
                if conflicts.len() != 1 {
                    write!(f, "s")?;
                }
                write!(f, ")")
            }
            EngineError::AlreadyTerminal(id) => {
                write!(f, "reservation {id} is already cancelled or overridden")
            }
            EngineError::AccessDenied(id) => {
                write!(f, "not the owner of reservation {id} and not an admin")
            }
            EngineError::RoomInUse(id) => {
                write!(f, "cannot delete room {id}: confirmed reservations exist")
            }
            EngineError::LockTimeout(id) => {
                write!(f, "room {id} busy: lock not acquired in time, retry")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
