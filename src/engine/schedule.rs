use crate::model::*;

use super::EngineError;

/// A reservation interval projected onto its wall-clock day: the weekday
/// plus ms-of-day offsets, the coordinates class blocks live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayProjection {
    pub day: DayOfWeek,
    pub start_ms: Ms,
    pub end_ms: Ms,
}

/// Project a span onto day-of-week / time-of-day. A span whose wall clock
/// leaves the start's calendar day is rejected — multi-day reservations are
/// out of scope. An end landing exactly on midnight projects to `DAY_MS`
/// and stays inside the day (half-open).
pub(crate) fn project(span: &Span) -> Result<DayProjection, EngineError> {
    let start_ms = span.start.rem_euclid(DAY_MS);
    let end_ms = start_ms + span.duration_ms();
    if end_ms > DAY_MS {
        return Err(EngineError::InvalidInterval(*span));
    }
    Ok(DayProjection {
        day: DayOfWeek::of_ms(span.start),
        start_ms,
        end_ms,
    })
}

/// Every class block on the projected weekday that overlaps the projected
/// window. The full list, not the first hit — the caller reports all of them.
pub(crate) fn class_conflicts(rs: &RoomState, proj: &DayProjection) -> Vec<ClassBlock> {
    let window = Span::new(proj.start_ms, proj.end_ms);
    rs.blocks_on(proj.day)
        .filter(|b| b.window_ms().overlaps(&window))
        .cloned()
        .collect()
}
