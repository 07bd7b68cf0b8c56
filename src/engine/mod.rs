mod access;
mod admission;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use access::{authorize, can_see, Action};
pub use error::{ConflictReason, EngineError, Entity};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wakeup takes every append already queued, writes the
/// batch, fsyncs once, then answers each caller with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                // Commit what we have before running a compaction or counter read.
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(batch = batch.len(), "WAL flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray buffered bytes don't ride
    // along with the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Rooms, users and bookings for one deployment, rebuilt from the WAL.
///
/// Rooms form an arena keyed by id, each behind its own lock; bookings live
/// inside their room and are found through `booking_to_room`.
pub struct Engine {
    pub(super) rooms: DashMap<RoomId, SharedRoomState>,
    pub(super) booking_to_room: Arc<DashMap<BookingId, RoomId>>,
    pub(super) users: DashMap<UserId, UserRecord>,
    /// Lowercased email → user id.
    pub(super) user_by_email: DashMap<String, UserId>,
    /// Serializes room/user creation so existence checks and inserts are atomic.
    pub(super) catalog_lock: Mutex<()>,
    /// Next booking `seq`. Bumped past every replayed booking on startup.
    pub(super) next_seq: AtomicU64,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a room-scoped event. Caller holds the room's write lock.
fn apply_to_room(rs: &mut RoomState, event: &Event, booking_index: &DashMap<BookingId, RoomId>) {
    match event {
        Event::RoomUpdated {
            name,
            capacity,
            location,
            amenities,
            ..
        } => {
            rs.name = name.clone();
            rs.capacity = *capacity;
            rs.location = location.clone();
            rs.amenities = amenities.clone();
        }
        Event::RoomActiveSet { active, .. } => rs.active = *active,
        Event::BookingCreated {
            id,
            room_id,
            user_id,
            span,
            purpose,
            created_at,
            seq,
        } => {
            rs.insert_booking(Booking {
                id: *id,
                room_id: *room_id,
                user_id: *user_id,
                span: *span,
                purpose: purpose.clone(),
                created_at: *created_at,
                updated_at: *created_at,
                seq: *seq,
            });
            booking_index.insert(*id, *room_id);
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            booking_index.remove(id);
        }
        // Handled at the map level.
        Event::RoomCreated { .. } | Event::UserRegistered { .. } | Event::UserActiveSet { .. } => {}
    }
}

/// Room targeted by a room-scoped event.
fn event_room_id(event: &Event) -> Option<RoomId> {
    match event {
        Event::RoomUpdated { id, .. } | Event::RoomActiveSet { id, .. } => Some(*id),
        Event::BookingCreated { room_id, .. } | Event::BookingDeleted { room_id, .. } => {
            Some(*room_id)
        }
        Event::RoomCreated { .. } | Event::UserRegistered { .. } | Event::UserActiveSet { .. } => {
            None
        }
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its group-commit writer.
    /// Must run inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            booking_to_room: Arc::new(DashMap::new()),
            users: DashMap::new(),
            user_by_email: DashMap::new(),
            catalog_lock: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            wal_tx,
        };

        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            rooms = engine.rooms.len(),
            users = engine.users.len(),
            bookings = engine.booking_to_room.len(),
            "engine state restored"
        );

        Ok(engine)
    }

    // Replay owns every Arc, so try_write never contends. blocking_write would
    // panic here since `new` runs inside the runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::RoomCreated {
                id,
                name,
                capacity,
                location,
                amenities,
            } => {
                let rs = RoomState::new(*id, name.clone(), *capacity, location.clone(), amenities.clone());
                self.rooms.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::UserRegistered { .. } | Event::UserActiveSet { .. } => self.apply_to_users(event),
            other => {
                if let Event::BookingCreated { seq, .. } = other {
                    self.next_seq.fetch_max(seq + 1, Ordering::Relaxed);
                }
                let Some(room_id) = event_room_id(other) else { return };
                let Some(rs) = self.get_room_state(&room_id) else {
                    tracing::warn!(%room_id, "replayed event for unknown room skipped");
                    return;
                };
                if let Ok(mut guard) = rs.try_write() {
                    apply_to_room(&mut guard, other, &self.booking_to_room);
                }
            }
        }
    }

    pub(super) fn apply_to_users(&self, event: &Event) {
        match event {
            Event::UserRegistered {
                id,
                email,
                name,
                is_admin,
            } => {
                self.user_by_email.insert(email.to_lowercase(), *id);
                self.users.insert(
                    *id,
                    UserRecord {
                        id: *id,
                        email: email.clone(),
                        name: name.clone(),
                        is_admin: *is_admin,
                        is_active: true,
                    },
                );
            }
            Event::UserActiveSet { id, active } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.is_active = *active;
                }
            }
            _ => {}
        }
    }

    /// Durably append through the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    pub(super) fn get_room_state(&self, id: &RoomId) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// WAL-append, then apply, handing the room guard back. Nothing changes in
    /// memory if the append fails.
    ///
    /// Once the append is queued the writer commits it whether or not our
    /// caller is still waiting, so the apply runs on its own task holding the
    /// guard. Dropping this future never leaves memory behind the WAL.
    pub(super) async fn persist_and_apply(
        &self,
        mut guard: OwnedRwLockWriteGuard<RoomState>,
        event: Event,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;

        let index = self.booking_to_room.clone();
        let applied = tokio::spawn(async move {
            rx.await
                .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
                .map_err(|e| EngineError::WalError(e.to_string()))?;
            apply_to_room(&mut guard, &event, &index);
            Ok(guard)
        });
        applied
            .await
            .map_err(|e| EngineError::WalError(format!("apply task failed: {e}")))?
    }

    /// Booking id → owning room, write-locked.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &BookingId,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let room_id = self
            .booking_to_room
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Booking, *booking_id))?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(Entity::Room, room_id))?;
        Ok(rs.write_owned().await)
    }
}
