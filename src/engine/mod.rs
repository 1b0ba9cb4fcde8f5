mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
mod schedule;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use ledger::OverrideLedger;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::LOCK_TIMEOUT_MS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub ledger: OverrideLedger,
    /// Reverse lookup: block/reservation id → room id.
    pub(super) entity_to_room: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a RoomState (no locking — caller holds the
/// room's write lock). Ledger appends ride on the same call so live commits
/// and replay agree.
fn apply_to_room(
    rs: &mut RoomState,
    event: &Event,
    entity_map: &DashMap<Ulid, Ulid>,
    ledger: &OverrideLedger,
) {
    match event {
        Event::ClassBlockAdded { block } => {
            entity_map.insert(block.id, block.room_id);
            rs.insert_block(block.clone());
        }
        Event::ClassBlockRemoved { id, .. } => {
            rs.remove_block(*id);
            entity_map.remove(id);
        }
        Event::ReservationPlaced { reservation } | Event::ReservationRecorded { reservation } => {
            entity_map.insert(reservation.id, reservation.room_id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationCancelled { id, .. } => {
            if let Some(r) = rs.reservation_mut(*id) {
                r.status = ReservationStatus::Cancelled;
            }
        }
        Event::ReservationsSuperseded {
            room_id,
            winner,
            losers,
            at,
        } => {
            for loser in losers {
                if let Some(r) = rs.reservation_mut(*loser) {
                    r.status = ReservationStatus::Overridden;
                    r.overridden_by = Some(winner.requester);
                    ledger.record(OverrideEntry {
                        actor: winner.requester,
                        reservation_id: *loser,
                        owner: r.requester.id,
                        room_id: *room_id,
                        at: *at,
                    });
                }
            }
            entity_map.insert(winner.id, *room_id);
            rs.insert_reservation(winner.clone());
        }
        Event::OverrideRecorded { entry } => {
            ledger.record(entry.clone());
        }
        // RoomCreated/Deleted are handled at the DashMap level, not here
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            ledger: OverrideLedger::new(),
            entity_to_room: DashMap::new(),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this
        // may run inside an async context (e.g. lazy campus creation).
        for event in &events {
            match event {
                Event::RoomCreated { id, number } => {
                    let rs = RoomState::new(*id, number.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::RoomDeleted { id } => {
                    if let Some((_, rs)) = engine.state.remove(id) {
                        let guard = rs.try_read().expect("replay: uncontended read");
                        for b in &guard.blocks {
                            engine.entity_to_room.remove(&b.id);
                        }
                        for r in &guard.reservations {
                            engine.entity_to_room.remove(&r.id);
                        }
                    }
                }
                Event::OverrideRecorded { entry } => {
                    engine.ledger.record(entry.clone());
                }
                other => {
                    if let Some(room_id) = event_room_id(other)
                        && let Some(entry) = engine.state.get(&room_id)
                    {
                        let rs_arc = entry.clone();
                        let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                        apply_to_room(&mut guard, other, &engine.entity_to_room, &engine.ledger);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_room.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call, under the caller's room
    /// lock. A WAL failure applies nothing, so an error path never leaves
    /// partial state.
    pub(super) async fn persist_and_apply(
        &self,
        room_id: Ulid,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.entity_to_room, &self.ledger);
        self.notify.send(room_id, event);
        Ok(())
    }

    /// Acquire the room's write lock within the exclusion-scope bound.
    pub(super) async fn write_room(
        &self,
        room_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        tokio::time::timeout(Duration::from_millis(LOCK_TIMEOUT_MS), rs.write_owned())
            .await
            .map_err(|_| EngineError::LockTimeout(room_id))
    }

    /// Lookup entity → room, then lock the room for writing (bounded).
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.write_room(room_id).await?;
        Ok((room_id, guard))
    }
}

/// Extract the room id from an event (for per-room events).
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ClassBlockAdded { block } => Some(block.room_id),
        Event::ClassBlockRemoved { room_id, .. }
        | Event::ReservationCancelled { room_id, .. }
        | Event::ReservationsSuperseded { room_id, .. } => Some(*room_id),
        Event::ReservationPlaced { reservation } | Event::ReservationRecorded { reservation } => {
            Some(reservation.room_id)
        }
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } | Event::OverrideRecorded { .. } => {
            None
        }
    }
}
