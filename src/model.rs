use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only absolute time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Upper bound for base-schedule minutes (24:00 is a valid block end).
pub const MINUTES_PER_DAY: u16 = 1440;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Clamp `self` to `window`. Caller guarantees the two overlap.
    pub fn clamp_to(&self, window: &Span) -> Span {
        Span::new(self.start.max(window.start), self.end.min(window.end))
    }
}

/// The day window `[midnight, midnight + 24h)` containing instant `t`.
pub fn day_window(t: Ms) -> Span {
    let start = t - t.rem_euclid(DAY_MS);
    Span::new(start, start + DAY_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Authenticated identity, supplied by the wire layer on every operation.
/// The engine trusts it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: Ulid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

pub const DAYS: [DayOfWeek; 7] = [
    DayOfWeek::Monday,
    DayOfWeek::Tuesday,
    DayOfWeek::Wednesday,
    DayOfWeek::Thursday,
    DayOfWeek::Friday,
    DayOfWeek::Saturday,
    DayOfWeek::Sunday,
];

impl DayOfWeek {
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Day of week of a unix-ms instant, in UTC wall clock.
    /// Pure integer arithmetic: the epoch day (1970-01-01) was a Thursday.
    pub fn of_ms(t: Ms) -> DayOfWeek {
        let days = t.div_euclid(DAY_MS);
        DAYS[(days + 3).rem_euclid(7) as usize]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DayOfWeek::Monday => "monday",
            DayOfWeek::Tuesday => "tuesday",
            DayOfWeek::Wednesday => "wednesday",
            DayOfWeek::Thursday => "thursday",
            DayOfWeek::Friday => "friday",
            DayOfWeek::Saturday => "saturday",
            DayOfWeek::Sunday => "sunday",
        }
    }

    pub fn parse(s: &str) -> Option<DayOfWeek> {
        DAYS.iter().find(|d| d.as_str() == s).copied()
    }
}

/// One entry of the immutable recurring class calendar. Times are minutes
/// since midnight; no reservation may displace a block, regardless of role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassBlock {
    pub id: Ulid,
    pub room_id: Ulid,
    pub day: DayOfWeek,
    pub start_min: u16,
    pub end_min: u16,
    pub subject: String,
    pub semester: String,
}

impl ClassBlock {
    /// Block times as ms-of-day offsets, for comparison against projected
    /// reservation intervals.
    pub fn window_ms(&self) -> Span {
        Span::new(
            Ms::from(self.start_min) * MINUTE_MS,
            Ms::from(self.end_min) * MINUTE_MS,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
    Overridden,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Overridden => "overridden",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Cancelled | ReservationStatus::Overridden
        )
    }
}

/// A single reservation record. `overridden_by` is `Some` exactly when
/// `status` is `Overridden`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester: Requester,
    pub span: Span,
    pub status: ReservationStatus,
    pub overridden_by: Option<Requester>,
}

impl Reservation {
    pub fn confirmed(id: Ulid, room_id: Ulid, requester: Requester, span: Span) -> Self {
        Self {
            id,
            room_id,
            requester,
            span,
            status: ReservationStatus::Confirmed,
            overridden_by: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

/// Append-only record of one displacement: `actor` superseded the
/// reservation `reservation_id` owned by `owner`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideEntry {
    pub actor: Requester,
    pub reservation_id: Ulid,
    pub owner: Ulid,
    pub room_id: Ulid,
    pub at: Ms,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub number: String,
    /// Base-schedule blocks, sorted by (day, start_min).
    pub blocks: Vec<ClassBlock>,
    /// All reservation records (every status), sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(id: Ulid, number: String) -> Self {
        Self {
            id,
            number,
            blocks: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert a block maintaining (day, start_min) order. Ties go after
    /// existing entries, so rebuilding from a snapshot preserves order.
    pub fn insert_block(&mut self, block: ClassBlock) {
        let key = (block.day.index(), block.start_min);
        let pos = self
            .blocks
            .partition_point(|b| (b.day.index(), b.start_min) <= key);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<ClassBlock> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    /// Blocks on one weekday, in start order.
    pub fn blocks_on(&self, day: DayOfWeek) -> impl Iterator<Item = &ClassBlock> {
        self.blocks.iter().filter(move |b| b.day == day)
    }

    /// Insert a reservation maintaining sort order by `span.start`. Ties
    /// go after existing records, so rebuilding from a snapshot preserves
    /// order.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Confirmed reservations whose span overlaps the query window.
    /// Binary search skips records starting at or after `query.end`.
    pub fn confirmed_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_confirmed() && r.span.end > query.start)
    }
}

/// The event types — the WAL record format. A supersede is one event so
/// recovery observes it all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        number: String,
    },
    RoomDeleted {
        id: Ulid,
    },
    ClassBlockAdded {
        block: ClassBlock,
    },
    ClassBlockRemoved {
        id: Ulid,
        room_id: Ulid,
    },
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: Ulid,
    },
    ReservationsSuperseded {
        room_id: Ulid,
        winner: Reservation,
        losers: Vec<Ulid>,
        at: Ms,
    },
    /// Compaction snapshot of one reservation record, any status.
    ReservationRecorded {
        reservation: Reservation,
    },
    /// Compaction snapshot of one override-ledger entry.
    OverrideRecorded {
        entry: OverrideEntry,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub number: String,
}

/// Merged single-day view of one room: the recurring blocks for that
/// weekday plus the confirmed reservations overlapping the date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDayView {
    pub day: DayOfWeek,
    pub window: Span,
    pub blocks: Vec<ClassBlock>,
    pub reservations: Vec<Reservation>,
}

/// Successful outcome of a reserve call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub reservation: Reservation,
    /// Reservations displaced by this placement, in store order.
    pub superseded: Vec<Reservation>,
}
