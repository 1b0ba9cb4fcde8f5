use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_windows;
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    fn rooms_snapshot(&self) -> Vec<SharedRoomState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms = self.rooms_snapshot();
        let mut infos = Vec::with_capacity(rooms.len());
        for rs in rooms {
            let guard = rs.read().await;
            infos.push(RoomInfo {
                id: guard.id,
                number: guard.number.clone(),
            });
        }
        infos.sort_by(|a, b| a.number.cmp(&b.number).then(a.id.cmp(&b.id)));
        infos
    }

    /// The recurring class calendar of one room, in (day, start) order.
    pub async fn get_schedule(&self, room_id: Ulid) -> Vec<ClassBlock> {
        let rs = match self.get_room(&room_id) {
            Some(rs) => rs,
            None => return Vec::new(),
        };
        let guard = rs.read().await;
        guard.blocks.clone()
    }

    /// The caller's confirmed and overridden reservations across every
    /// room, ordered by start time. Overridden records carry the identity
    /// that displaced them.
    pub async fn list_mine(&self, caller: Ulid) -> Vec<Reservation> {
        let rooms = self.rooms_snapshot();
        let mut mine = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            mine.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| {
                        r.requester.id == caller && r.status != ReservationStatus::Cancelled
                    })
                    .cloned(),
            );
        }
        mine.sort_by_key(|r| (r.span.start, r.id));
        mine
    }

    /// Merged single-day view of one room: the recurring blocks for that
    /// date's weekday plus the confirmed reservations overlapping the
    /// date. `date` is any instant inside the target day.
    pub async fn room_day(&self, room_id: Ulid, date: Ms) -> Result<RoomDayView, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;

        let window = day_window(date);
        let day = DayOfWeek::of_ms(window.start);
        Ok(RoomDayView {
            day,
            window,
            blocks: guard.blocks_on(day).cloned().collect(),
            reservations: guard.confirmed_overlapping(&window).cloned().collect(),
        })
    }

    /// Free windows of one room inside a bounded query window: the window
    /// minus projected class blocks minus confirmed reservations.
    pub async fn compute_availability(
        &self,
        room_id: Ulid,
        query_start: Ms,
        query_end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        if query_end <= query_start {
            return Err(EngineError::InvalidInterval(Span::new(query_start, query_end)));
        }
        if query_end - query_start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = match self.get_room(&room_id) {
            Some(rs) => rs,
            None => return Ok(Vec::new()),
        };
        let guard = rs.read().await;

        let query = Span::new(query_start, query_end);
        let mut free = free_windows(&guard, &query);
        if let Some(min_dur) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(free)
    }
}
