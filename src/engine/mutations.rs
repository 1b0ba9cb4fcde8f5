use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use std::sync::Arc;

use crate::limits::*;
use crate::model::*;

use super::conflict::{self, now_ms, validate_request};
use super::schedule;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Collaborator surfaces: room registration, class calendar ──

    pub async fn create_room(&self, id: Ulid, number: String) -> Result<(), EngineError> {
        if self.state.len() >= MAX_ROOMS_PER_CAMPUS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if number.is_empty() || number.len() > MAX_ROOM_NUMBER_LEN {
            return Err(EngineError::LimitExceeded("bad room number length"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomCreated {
            id,
            number: number.clone(),
        };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(RoomState::new(id, number))));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Deregister a room. Refused while confirmed reservations exist —
    /// cancel or supersede them first.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.write_room(id).await?;
        if guard.reservations.iter().any(|r| r.is_confirmed()) {
            return Err(EngineError::RoomInUse(id));
        }

        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        for b in &guard.blocks {
            self.entity_to_room.remove(&b.id);
        }
        for r in &guard.reservations {
            self.entity_to_room.remove(&r.id);
        }
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// Add one entry to the recurring class calendar. Staff surface,
    /// outside the booking flow; entries are immutable once created.
    pub async fn add_class_block(
        &self,
        id: Ulid,
        room_id: Ulid,
        day: DayOfWeek,
        start_min: u16,
        end_min: u16,
        subject: String,
        semester: String,
    ) -> Result<(), EngineError> {
        if end_min <= start_min || end_min > MINUTES_PER_DAY {
            return Err(EngineError::LimitExceeded("bad block minutes"));
        }
        if subject.is_empty() || subject.len() > MAX_SUBJECT_LEN {
            return Err(EngineError::LimitExceeded("bad subject length"));
        }
        if semester.len() > MAX_SEMESTER_LEN {
            return Err(EngineError::LimitExceeded("bad semester length"));
        }
        if self.entity_to_room.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.write_room(room_id).await?;
        if guard.blocks.len() >= MAX_BLOCKS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many blocks on room"));
        }

        let event = Event::ClassBlockAdded {
            block: ClassBlock {
                id,
                room_id,
                day,
                start_min,
                end_min,
                subject,
                semester,
            },
        };
        self.persist_and_apply(room_id, &mut guard, &event).await
    }

    /// Retire a calendar entry (semester turnover). The only mutation the
    /// base schedule supports besides creation.
    pub async fn remove_class_block(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (room_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.blocks.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ClassBlockRemoved { id, room_id };
        self.persist_and_apply(room_id, &mut guard, &event).await?;
        Ok(room_id)
    }

    // ── The conflict resolver ─────────────────────────────────────

    /// Resolve a booking request: free, vetoed by the class calendar, or
    /// contested — and if contested, decided by priority over the entire
    /// conflict set, committed all-or-nothing.
    ///
    /// The room's write lock is held from the conflict query through the
    /// WAL append and in-memory apply, so concurrent resolves on one room
    /// serialize; rooms never contend with each other.
    pub async fn reserve(
        &self,
        requester: Requester,
        id: Ulid,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Placement, EngineError> {
        let span = validate_request(&requester, start, end)?;
        let proj = schedule::project(&span)?;
        if self.entity_to_room.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let mut guard = self.write_room(room_id).await?;
        if guard.reservations.len() + guard.blocks.len() >= MAX_RECORDS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many records on room"));
        }

        // The class calendar vetoes every role, admin included.
        let blocks = schedule::class_conflicts(&guard, &proj);
        if !blocks.is_empty() {
            return Err(EngineError::BaseScheduleConflict { blocks });
        }

        let conflicts = conflict::conflict_set(&guard, &span);
        let reservation = Reservation::confirmed(id, room_id, requester, span);

        if conflicts.is_empty() {
            let event = Event::ReservationPlaced {
                reservation: reservation.clone(),
            };
            self.persist_and_apply(room_id, &mut guard, &event).await?;
            return Ok(Placement {
                reservation,
                superseded: Vec::new(),
            });
        }

        conflict::decide(&requester, &conflicts)?;

        // One WAL record for the whole supersede — recovery sees either
        // none of it or all of it.
        let losers: Vec<Ulid> = conflicts.iter().map(|r| r.id).collect();
        let event = Event::ReservationsSuperseded {
            room_id,
            winner: reservation.clone(),
            losers,
            at: now_ms(),
        };
        self.persist_and_apply(room_id, &mut guard, &event).await?;

        Ok(Placement {
            reservation,
            superseded: conflicts,
        })
    }

    /// Cancel a reservation. Owner or admin only; terminal records stay
    /// terminal. Serialized through the same room lock as `reserve`, so a
    /// record contested by a concurrent override ends in exactly one
    /// terminal state.
    pub async fn cancel(&self, caller: Requester, id: Ulid) -> Result<(), EngineError> {
        let (room_id, mut guard) = self.resolve_entity_write(&id).await?;
        let r = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        if r.requester.id != caller.id && caller.role != Role::Admin {
            return Err(EngineError::AccessDenied(id));
        }
        if r.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(id));
        }
        let event = Event::ReservationCancelled { id, room_id };
        self.persist_and_apply(room_id, &mut guard, &event).await
    }

    // ── WAL maintenance ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state: per room a creation, its blocks, and a snapshot of every
    /// reservation record (terminal history included), then the ledger.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let rooms: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                id: guard.id,
                number: guard.number.clone(),
            });
            for block in &guard.blocks {
                events.push(Event::ClassBlockAdded {
                    block: block.clone(),
                });
            }
            for reservation in &guard.reservations {
                events.push(Event::ReservationRecorded {
                    reservation: reservation.clone(),
                });
            }
        }
        for entry in self.ledger.all() {
            events.push(Event::OverrideRecorded { entry });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
