use crate::identity::{Capability, Principal, Requester};
use crate::model::*;

use super::access::{authorize, can_see, Action};
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Room lookup used by admission: inactive rooms are treated as absent.
    pub async fn get_room(&self, id: RoomId) -> Result<RoomInfo, EngineError> {
        let rs = self
            .get_room_state(&id)
            .ok_or(EngineError::NotFound(Entity::Room, id))?;
        let guard = rs.read().await;
        if !guard.active {
            return Err(EngineError::NotFound(Entity::Room, id));
        }
        Ok(guard.info())
    }

    /// Active rooms, plus inactive ones for principals who manage rooms.
    /// Sorted by name, then id.
    pub async fn list_rooms(&self, principal: &impl Principal) -> Vec<RoomInfo> {
        let include_inactive = principal.has(Capability::ManageRooms);
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();

        let mut rooms = Vec::with_capacity(handles.len());
        for rs in handles {
            let guard = rs.read().await;
            if guard.active || include_inactive {
                rooms.push(guard.info());
            }
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        rooms
    }

    pub async fn get_booking(&self, principal: &impl Principal, id: BookingId) -> Result<Booking, EngineError> {
        let room_id = self
            .booking_to_room
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        let guard = rs.read().await;
        let booking = guard
            .booking(id)
            .ok_or(EngineError::NotFound(Entity::Booking, id))?;
        authorize(booking, principal, Action::Read)?;
        Ok(booking.clone())
    }

    /// Every booking the principal may see, in admission order, windowed by
    /// `page`. Filters rather than rejects.
    pub async fn list_bookings(&self, principal: &impl Principal, page: Page) -> Vec<Booking> {
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();

        let mut visible = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            visible.extend(guard.bookings.iter().filter(|b| can_see(b, principal)).cloned());
        }
        visible.sort_by_key(|b| b.seq);
        visible.into_iter().skip(page.offset).take(page.limit).collect()
    }

    pub fn get_user(&self, id: UserId) -> Option<UserRecord> {
        self.users.get(&id).map(|u| u.value().clone())
    }

    /// Case-insensitive email lookup.
    pub fn find_user_by_email(&self, email: &str) -> Option<UserRecord> {
        let id = *self.user_by_email.get(&email.to_lowercase())?;
        self.get_user(id)
    }

    /// Identity lookup for the boundary: active users only.
    pub fn resolve_principal(&self, email: &str) -> Option<Requester> {
        self.find_user_by_email(email)
            .filter(|u| u.is_active)
            .map(|u| Requester::from(&u))
    }
}
