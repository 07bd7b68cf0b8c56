use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::identity::{Capability, Principal};
use crate::limits::*;
use crate::model::*;
use crate::observability::{self, BOOKINGS_ADMITTED_TOTAL, BOOKINGS_REJECTED_TOTAL};

use super::access::{authorize, require, Action};
use super::admission::{admit, now_ms};
use super::{Engine, EngineError, Entity, WalCommand};

fn validate_room_fields(name: &str, capacity: u32, location: &str, amenities: &str) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::InvalidInput("room capacity must be at least 1"));
    }
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("room name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    if location.len() > MAX_LOCATION_LEN {
        return Err(EngineError::LimitExceeded("room location too long"));
    }
    if amenities.len() > MAX_AMENITIES_LEN {
        return Err(EngineError::LimitExceeded("room amenities too long"));
    }
    Ok(())
}

fn validate_user_fields(email: &str, name: &str) -> Result<(), EngineError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
        _ => return Err(EngineError::InvalidInput("malformed email")),
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("user name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, principal: &impl Principal, room: NewRoom) -> Result<RoomInfo, EngineError> {
        require(principal, Capability::ManageRooms)?;
        validate_room_fields(&room.name, room.capacity, &room.location, &room.amenities)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }

        let NewRoom {
            id,
            name,
            capacity,
            location,
            amenities,
        } = room;
        let event = Event::RoomCreated {
            id,
            name: name.clone(),
            capacity,
            location: location.clone(),
            amenities: amenities.clone(),
        };
        self.wal_append(&event).await?;
        let rs = RoomState::new(id, name, capacity, location, amenities);
        let info = rs.info();
        self.rooms.insert(id, Arc::new(RwLock::new(rs)));
        tracing::info!(room = %id, capacity, "room created");
        Ok(info)
    }

    /// New capacity applies to later admissions only; existing bookings stay.
    pub async fn update_room(
        &self,
        principal: &impl Principal,
        id: RoomId,
        changes: RoomChanges,
    ) -> Result<RoomInfo, EngineError> {
        require(principal, Capability::ManageRooms)?;
        validate_room_fields(&changes.name, changes.capacity, &changes.location, &changes.amenities)?;
        let rs = self
            .get_room_state(&id)
            .ok_or(EngineError::NotFound(Entity::Room, id))?;
        let guard = rs.write_owned().await;

        let RoomChanges {
            name,
            capacity,
            location,
            amenities,
        } = changes;
        let event = Event::RoomUpdated {
            id,
            name,
            capacity,
            location,
            amenities,
        };
        let guard = self.persist_and_apply(guard, event).await?;
        Ok(guard.info())
    }

    /// Inactive rooms refuse new bookings; their existing bookings remain.
    pub async fn set_room_active(
        &self,
        principal: &impl Principal,
        id: RoomId,
        active: bool,
    ) -> Result<RoomInfo, EngineError> {
        require(principal, Capability::ManageRooms)?;
        let rs = self
            .get_room_state(&id)
            .ok_or(EngineError::NotFound(Entity::Room, id))?;
        let mut guard = rs.write_owned().await;
        if guard.active != active {
            let event = Event::RoomActiveSet { id, active };
            guard = self.persist_and_apply(guard, event).await?;
            tracing::info!(room = %id, active, "room activation changed");
        }
        Ok(guard.info())
    }

    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(&self, principal: &impl Principal, user: NewUser) -> Result<UserRecord, EngineError> {
        require(principal, Capability::ManageUsers)?;
        self.insert_user(user).await
    }

    async fn insert_user(&self, user: NewUser) -> Result<UserRecord, EngineError> {
        validate_user_fields(&user.email, &user.name)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&user.id) {
            return Err(EngineError::AlreadyExists(user.id));
        }
        if self.user_by_email.contains_key(&user.email.to_lowercase()) {
            return Err(EngineError::EmailTaken(user.email));
        }

        let event = Event::UserRegistered {
            id: user.id,
            email: user.email,
            name: user.name,
            is_admin: user.is_admin,
        };
        self.wal_append(&event).await?;
        self.apply_to_users(&event);
        tracing::info!(user = %user.id, admin = user.is_admin, "user registered");
        self.users
            .get(&user.id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(Entity::User, user.id))
    }

    pub async fn set_user_active(
        &self,
        principal: &impl Principal,
        id: UserId,
        active: bool,
    ) -> Result<UserRecord, EngineError> {
        require(principal, Capability::ManageUsers)?;
        let _catalog = self.catalog_lock.lock().await;
        let current = self
            .users
            .get(&id)
            .map(|u| u.is_active)
            .ok_or(EngineError::NotFound(Entity::User, id))?;
        if current != active {
            let event = Event::UserActiveSet { id, active };
            self.wal_append(&event).await?;
            self.apply_to_users(&event);
        }
        self.users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(Entity::User, id))
    }

    /// Startup bootstrap: make sure an administrator with `email` exists.
    /// An existing account with that email is returned as is.
    pub async fn ensure_admin(&self, email: &str, name: &str) -> Result<UserRecord, EngineError> {
        if let Some(user) = self.find_user_by_email(email) {
            if !user.is_admin {
                tracing::warn!(email, "bootstrap admin email belongs to a non-admin account");
            }
            return Ok(user);
        }
        self.insert_user(NewUser {
            id: Ulid::new(),
            email: email.to_string(),
            name: name.to_string(),
            is_admin: true,
        })
        .await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Admit or reject a booking for `principal`.
    ///
    /// The room's write lock is held from the admission checks through the
    /// durable append, so concurrent requests for the same room serialize and
    /// can never both take the last slot.
    pub async fn create_booking(
        &self,
        principal: &impl Principal,
        request: BookingRequest,
    ) -> Result<Booking, EngineError> {
        self.create_booking_at(principal, request, now_ms()).await
    }

    pub(super) async fn create_booking_at(
        &self,
        principal: &impl Principal,
        request: BookingRequest,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let result = self.try_admit(principal, request, now).await;
        match &result {
            Ok(booking) => {
                metrics::counter!(BOOKINGS_ADMITTED_TOTAL).increment(1);
                tracing::info!(
                    booking = %booking.id,
                    room = %booking.room_id,
                    user = %booking.user_id,
                    start = booking.span.start,
                    end = booking.span.end,
                    "booking admitted"
                );
            }
            Err(e) => {
                metrics::counter!(BOOKINGS_REJECTED_TOTAL, "reason" => observability::rejection_label(e))
                    .increment(1);
                tracing::debug!(requester = %principal.id(), "booking rejected: {e}");
            }
        }
        result
    }

    async fn try_admit(
        &self,
        principal: &impl Principal,
        request: BookingRequest,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let BookingRequest {
            id,
            room_id,
            span,
            purpose,
        } = request;

        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(Entity::Room, room_id))?;
        let guard = rs.write_owned().await;
        if !guard.active {
            return Err(EngineError::NotFound(Entity::Room, room_id));
        }

        if purpose.len() > MAX_PURPOSE_LEN {
            return Err(EngineError::LimitExceeded("purpose too long"));
        }
        if guard.count_active(now) >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        if self.booking_to_room.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let user_id = principal.id();
        admit(&guard, user_id, &span, now)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let booking = Booking {
            id,
            room_id,
            user_id,
            span,
            purpose,
            created_at: now,
            updated_at: now,
            seq,
        };
        let event = Event::BookingCreated {
            id,
            room_id,
            user_id,
            span,
            purpose: booking.purpose.clone(),
            created_at: now,
            seq,
        };
        self.persist_and_apply(guard, event).await?;
        Ok(booking)
    }

    /// Remove a booking the principal may delete. Frees its capacity slot and
    /// the owner's active-booking claim on the room immediately.
    pub async fn delete_booking(&self, principal: &impl Principal, id: BookingId) -> Result<Booking, EngineError> {
        let guard = self.resolve_booking_write(&id).await?;
        let booking = guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        authorize(&booking, principal, Action::Delete)?;

        let event = Event::BookingDeleted {
            id,
            room_id: guard.id,
        };
        self.persist_and_apply(guard, event).await?;
        tracing::info!(booking = %id, room = %booking.room_id, by = %principal.id(), "booking deleted");
        Ok(booking)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event set for the current state.
    ///
    /// Holds the catalog lock and a read lock on every room until the writer
    /// has swapped files, so no event can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut room_ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort();
        let mut guards = Vec::with_capacity(room_ids.len());
        for id in &room_ids {
            if let Some(rs) = self.get_room_state(id) {
                guards.push(rs.read_owned().await);
            }
        }

        let mut events = Vec::new();
        let mut users: Vec<UserRecord> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        for user in users {
            events.push(Event::UserRegistered {
                id: user.id,
                email: user.email,
                name: user.name,
                is_admin: user.is_admin,
            });
            if !user.is_active {
                events.push(Event::UserActiveSet { id: user.id, active: false });
            }
        }
        for rs in &guards {
            events.push(Event::RoomCreated {
                id: rs.id,
                name: rs.name.clone(),
                capacity: rs.capacity,
                location: rs.location.clone(),
                amenities: rs.amenities.clone(),
            });
            if !rs.active {
                events.push(Event::RoomActiveSet { id: rs.id, active: false });
            }
            for b in &rs.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    room_id: b.room_id,
                    user_id: b.user_id,
                    span: b.span,
                    purpose: b.purpose.clone(),
                    created_at: b.created_at,
                    seq: b.seq,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
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
