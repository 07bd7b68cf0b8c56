use crate::model::{UserId, UserRecord};

/// Something a principal may be allowed to do beyond touching its own bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Read and delete any user's bookings; list every booking.
    ManageAllBookings,
    /// Create, edit and (de)activate rooms; see inactive rooms.
    ManageRooms,
    /// Register and (de)activate users.
    ManageUsers,
}

/// The authenticated caller, as supplied by the boundary layer.
/// The engine never authenticates; it only asks these two questions.
pub trait Principal {
    fn id(&self) -> UserId;
    fn has(&self, capability: Capability) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    /// Members act only on their own bookings.
    fn grants(self, _capability: Capability) -> bool {
        matches!(self, Role::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub id: UserId,
    pub role: Role,
}

impl Requester {
    pub fn member(id: UserId) -> Self {
        Self { id, role: Role::Member }
    }

    pub fn admin(id: UserId) -> Self {
        Self { id, role: Role::Admin }
    }
}

impl From<&UserRecord> for Requester {
    fn from(user: &UserRecord) -> Self {
        let role = if user.is_admin { Role::Admin } else { Role::Member };
        Self { id: user.id, role }
    }
}

impl Principal for Requester {
    fn id(&self) -> UserId {
        self.id
    }

    fn has(&self, capability: Capability) -> bool {
        self.role.grants(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn admin_holds_every_capability() {
        let admin = Requester::admin(Ulid::new());
        assert!(admin.has(Capability::ManageAllBookings));
        assert!(admin.has(Capability::ManageRooms));
        assert!(admin.has(Capability::ManageUsers));
    }

    #[test]
    fn member_holds_none() {
        let member = Requester::member(Ulid::new());
        assert!(!member.has(Capability::ManageAllBookings));
        assert!(!member.has(Capability::ManageRooms));
        assert!(!member.has(Capability::ManageUsers));
    }

    #[test]
    fn role_follows_admin_flag() {
        let mut user = UserRecord {
            id: Ulid::new(),
            email: "ana@example.com".into(),
            name: "Ana".into(),
            is_admin: false,
            is_active: true,
        };
        assert_eq!(Requester::from(&user).role, Role::Member);
        user.is_admin = true;
        let r = Requester::from(&user);
        assert_eq!(r.role, Role::Admin);
        assert_eq!(r.id(), user.id);
    }
}
