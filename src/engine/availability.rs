use crate::model::*;

// ── Free-window computation ──────────────────────────────────────
//
// A room's free time inside a query window is the window minus the
// projected class blocks of every day the window touches, minus the
// confirmed reservations. All interval math is on sorted, half-open spans.

/// Occupied spans (absolute ms, clamped to `query`): recurring blocks
/// materialized onto each day the window covers, plus confirmed
/// reservations.
pub(crate) fn busy_spans(rs: &RoomState, query: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = Vec::new();

    let mut day_start = query.start - query.start.rem_euclid(DAY_MS);
    while day_start < query.end {
        let day = DayOfWeek::of_ms(day_start);
        for block in rs.blocks_on(day) {
            let w = block.window_ms();
            let abs = Span::new(day_start + w.start, day_start + w.end);
            if abs.overlaps(query) {
                busy.push(abs.clamp_to(query));
            }
        }
        day_start += DAY_MS;
    }

    for r in rs.confirmed_overlapping(query) {
        busy.push(r.span.clamp_to(query));
    }

    busy.sort_by_key(|s| s.start);
    busy
}

/// Free windows of `rs` inside `query`.
pub fn free_windows(rs: &RoomState, query: &Span) -> Vec<Span> {
    let busy = merge_overlapping(&busy_spans(rs, query));
    subtract_intervals(&[*query], &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Subtract sorted disjoint `to_remove` spans from sorted `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
