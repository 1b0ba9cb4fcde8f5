use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// Request validation, before any lock is taken. Order matters: interval
/// shape first, then bounds, then the role-specific duration cap.
pub(crate) fn validate_request(
    requester: &Requester,
    start: Ms,
    end: Ms,
) -> Result<Span, EngineError> {
    use crate::limits::*;
    if end <= start {
        return Err(EngineError::InvalidInterval(Span::new(start, end)));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    if requester.role == Role::Student && span.duration_ms() > STUDENT_MAX_DURATION_MS {
        return Err(EngineError::DurationExceeded {
            limit_ms: STUDENT_MAX_DURATION_MS,
            got_ms: span.duration_ms(),
        });
    }
    Ok(span)
}

/// The complete set of confirmed reservations overlapping `span`.
/// Overridability is decided over the whole set in one step — stopping at
/// the first hit would let a requester fill gaps around a blocking
/// reservation and leave the calendar in a state no single decision made.
pub(crate) fn conflict_set(rs: &RoomState, span: &Span) -> Vec<Reservation> {
    rs.confirmed_overlapping(span).cloned().collect()
}

/// Priority policy over a non-empty conflict set. Set-wide and
/// non-symmetric: one non-overridable member poisons the whole request.
pub(crate) fn decide(requester: &Requester, conflicts: &[Reservation]) -> Result<(), EngineError> {
    match requester.role {
        Role::Admin => Ok(()),
        Role::Teacher => {
            let blocking: Vec<Reservation> = conflicts
                .iter()
                .filter(|r| r.requester.role != Role::Student)
                .cloned()
                .collect();
            if blocking.is_empty() {
                Ok(())
            } else {
                Err(EngineError::BlockedByEqualOrHigher {
                    conflicts: blocking,
                })
            }
        }
        Role::Student => Err(EngineError::Blocked {
            conflicts: conflicts.to_vec(),
        }),
    }
}
