use super::admission::{admit, check_capacity, check_no_active_duplicate};
use super::*;
use crate::identity::{Principal, Requester};
use crate::limits::*;
use ulid::Ulid;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// Midnight of the day the scenarios run on; `now` sits just before it.
const DAY: Ms = 1_767_225_600_000;
const NOW: Ms = DAY - H;

fn at(hours: Ms, minutes: Ms) -> Ms {
    DAY + hours * H + minutes * M
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn admin() -> Requester {
    Requester::admin(Ulid::new())
}

fn member() -> Requester {
    Requester::member(Ulid::new())
}

fn new_room(name: &str, capacity: u32) -> NewRoom {
    NewRoom {
        id: Ulid::new(),
        name: name.into(),
        capacity,
        location: "HQ".into(),
        amenities: String::new(),
    }
}

fn request(room_id: RoomId, start: Ms, end: Ms) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        room_id,
        span: Span::new(start, end),
        purpose: "sync".into(),
    }
}

async fn engine_with_room(name: &str, capacity: u32) -> (Engine, RoomId) {
    let engine = Engine::new(test_wal_path(name)).unwrap();
    let room = engine.create_room(&admin(), new_room(name, capacity)).await.unwrap();
    (engine, room.id)
}

fn room_with(capacity: u32, bookings: &[(UserId, Ms, Ms)]) -> RoomState {
    let mut rs = RoomState::new(Ulid::new(), "R".into(), capacity, String::new(), String::new());
    for &(user_id, start, end) in bookings {
        rs.insert_booking(Booking {
            id: Ulid::new(),
            room_id: rs.id,
            user_id,
            span: Span::new(start, end),
            purpose: String::new(),
            created_at: 0,
            updated_at: 0,
            seq: 0,
        });
    }
    rs
}

fn assert_conflict(result: Result<Booking, EngineError>, expected: ConflictReason) {
    match result {
        Err(EngineError::Conflict(reason)) => assert_eq!(reason, expected),
        other => panic!("expected {expected:?}, got {other:?}"),
    }
}

// ── Admission rules on a bare room ───────────────────────

#[test]
fn capacity_counts_every_overlapping_booking() {
    let rs = room_with(2, &[(Ulid::new(), at(9, 0), at(10, 0)), (Ulid::new(), at(9, 30), at(10, 30))]);
    let err = check_capacity(&rs, &Span::new(at(9, 45), at(10, 15))).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Conflict(ConflictReason::CapacityExceeded { capacity: 2 })
    ));
}

#[test]
fn capacity_counts_bookings_that_never_meet_each_other() {
    // [9,10) and [11,12) never overlap each other, but both overlap [9:30,11:30).
    let rs = room_with(2, &[(Ulid::new(), at(9, 0), at(10, 0)), (Ulid::new(), at(11, 0), at(12, 0))]);
    assert!(check_capacity(&rs, &Span::new(at(9, 30), at(11, 30))).is_err());
    assert!(check_capacity(&rs, &Span::new(at(10, 0), at(11, 0))).is_ok());
}

#[test]
fn touching_bookings_do_not_count() {
    let rs = room_with(1, &[(Ulid::new(), at(10, 0), at(11, 0))]);
    assert!(check_capacity(&rs, &Span::new(at(11, 0), at(12, 0))).is_ok());
    assert!(check_capacity(&rs, &Span::new(at(9, 0), at(10, 0))).is_ok());
    assert!(check_capacity(&rs, &Span::new(at(10, 59), at(11, 30))).is_err());
}

#[test]
fn duplicate_rule_ignores_overlap() {
    let user = Ulid::new();
    let rs = room_with(5, &[(user, at(9, 0), at(10, 0))]);
    assert!(check_no_active_duplicate(&rs, user, NOW).is_err());
    assert!(check_no_active_duplicate(&rs, Ulid::new(), NOW).is_ok());
}

#[test]
fn ended_booking_is_not_active() {
    let user = Ulid::new();
    let rs = room_with(5, &[(user, at(9, 0), at(10, 0))]);
    // end == now is no longer active.
    assert!(check_no_active_duplicate(&rs, user, at(10, 0)).is_ok());
    assert!(check_no_active_duplicate(&rs, user, at(9, 59)).is_err());
}

#[test]
fn duplicate_wins_when_both_rules_fail() {
    let user = Ulid::new();
    let rs = room_with(1, &[(user, at(9, 0), at(10, 0))]);
    let err = admit(&rs, user, &Span::new(at(9, 0), at(10, 0)), NOW).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Conflict(ConflictReason::DuplicateActiveBooking)
    ));
}

// ── Booking scenarios through the engine ─────────────────

#[tokio::test]
async fn third_overlapping_booking_exceeds_capacity_two() {
    let (engine, room) = engine_with_room("capacity_two.wal", 2).await;
    let (a, b, c) = (member(), member(), member());

    engine
        .create_booking_at(&a, request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();
    engine
        .create_booking_at(&b, request(room, at(9, 30), at(10, 30)), NOW)
        .await
        .unwrap();
    let rejected = engine
        .create_booking_at(&c, request(room, at(9, 45), at(10, 15)), NOW)
        .await;
    assert_conflict(rejected, ConflictReason::CapacityExceeded { capacity: 2 });
}

#[tokio::test]
async fn second_active_booking_in_same_room_is_duplicate() {
    let (engine, room) = engine_with_room("duplicate.wal", 5).await;
    let a = member();

    engine
        .create_booking_at(&a, request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();
    let rejected = engine
        .create_booking_at(&a, request(room, at(14, 0), at(15, 0)), NOW)
        .await;
    assert_conflict(rejected, ConflictReason::DuplicateActiveBooking);
}

#[tokio::test]
async fn finished_booking_does_not_block_a_new_one() {
    let (engine, room) = engine_with_room("finished.wal", 1).await;
    let a = member();

    engine
        .create_booking_at(&a, request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();
    // Later that day the first booking has ended.
    engine
        .create_booking_at(&a, request(room, at(14, 0), at(15, 0)), at(12, 0))
        .await
        .unwrap();
}

#[tokio::test]
async fn same_user_may_book_other_rooms() {
    let engine = Engine::new(test_wal_path("other_rooms.wal")).unwrap();
    let boss = admin();
    let r1 = engine.create_room(&boss, new_room("One", 1)).await.unwrap().id;
    let r2 = engine.create_room(&boss, new_room("Two", 1)).await.unwrap().id;
    let a = member();

    engine
        .create_booking_at(&a, request(r1, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();
    engine
        .create_booking_at(&a, request(r2, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();
}

#[tokio::test]
async fn booking_unknown_room_is_not_found() {
    let engine = Engine::new(test_wal_path("unknown_room.wal")).unwrap();
    let missing = Ulid::new();
    let err = engine
        .create_booking(&member(), request(missing, at(9, 0), at(10, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Room, id) if id == missing));
}

#[tokio::test]
async fn unknown_room_wins_over_oversized_purpose() {
    let engine = Engine::new(test_wal_path("unknown_room_purpose.wal")).unwrap();
    let mut req = request(Ulid::new(), at(9, 0), at(10, 0));
    req.purpose = "x".repeat(MAX_PURPOSE_LEN + 1);
    let err = engine.create_booking(&member(), req).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Room, _)));
}

#[tokio::test]
async fn oversized_purpose_is_rejected() {
    let (engine, room) = engine_with_room("purpose_limit.wal", 1).await;
    let mut req = request(room, at(9, 0), at(10, 0));
    req.purpose = "x".repeat(MAX_PURPOSE_LEN + 1);
    let err = engine.create_booking_at(&member(), req, NOW).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

fn stored_booking(room_id: RoomId, start: Ms, end: Ms) -> Booking {
    Booking {
        id: Ulid::new(),
        room_id,
        user_id: Ulid::new(),
        span: Span::new(start, end),
        purpose: String::new(),
        created_at: 0,
        updated_at: 0,
        seq: 0,
    }
}

#[tokio::test]
async fn room_cap_counts_only_bookings_that_have_not_ended() {
    let (engine, room) = engine_with_room("room_cap.wal", u32::MAX).await;
    let rs = engine.get_room_state(&room).unwrap();
    {
        let mut guard = rs.write().await;
        for i in 0..MAX_BOOKINGS_PER_ROOM as Ms {
            guard.insert_booking(stored_booking(room, i * M, (i + 1) * M));
        }
    }

    engine
        .create_booking_at(&member(), request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();

    {
        let mut guard = rs.write().await;
        for i in 1..MAX_BOOKINGS_PER_ROOM as Ms {
            guard.insert_booking(stored_booking(room, at(20, 0) + i * M, at(21, 0) + i * M));
        }
    }
    let full = engine
        .create_booking_at(&member(), request(room, at(9, 0), at(10, 0)), NOW)
        .await;
    assert!(matches!(full, Err(EngineError::LimitExceeded(_))), "got {full:?}");
}

#[tokio::test]
async fn inactive_room_refuses_bookings() {
    let (engine, room) = engine_with_room("inactive_room.wal", 3).await;
    engine.set_room_active(&admin(), room, false).await.unwrap();

    let err = engine
        .create_booking_at(&member(), request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Room, _)));
}

#[tokio::test]
async fn reused_booking_id_is_rejected() {
    let (engine, room) = engine_with_room("reused_id.wal", 5).await;
    let first = engine
        .create_booking_at(&member(), request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();

    let mut again = request(room, at(11, 0), at(12, 0));
    again.id = first.id;
    let err = engine.create_booking_at(&member(), again, NOW).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == first.id));
}

#[tokio::test]
async fn admitted_booking_carries_requester_and_timestamps() {
    let (engine, room) = engine_with_room("admitted_fields.wal", 1).await;
    let a = member();
    let booking = engine
        .create_booking_at(&a, request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();
    assert_eq!(booking.user_id, a.id());
    assert_eq!(booking.room_id, room);
    assert_eq!(booking.created_at, NOW);
    assert_eq!(booking.updated_at, NOW);
    assert_eq!(engine.get_booking(&a, booking.id).await.unwrap(), booking);
}

// ── Access control ───────────────────────────────────────

#[tokio::test]
async fn only_owner_or_admin_may_read() {
    let (engine, room) = engine_with_room("read_access.wal", 2).await;
    let owner = member();
    let booking = engine
        .create_booking_at(&owner, request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();

    assert!(matches!(
        engine.get_booking(&member(), booking.id).await,
        Err(EngineError::Forbidden)
    ));
    assert_eq!(engine.get_booking(&admin(), booking.id).await.unwrap().id, booking.id);
    assert_eq!(engine.get_booking(&owner, booking.id).await.unwrap().id, booking.id);
}

#[tokio::test]
async fn missing_booking_is_not_found_before_authorization() {
    let engine = Engine::new(test_wal_path("missing_booking.wal")).unwrap();
    let id = Ulid::new();
    assert!(matches!(
        engine.get_booking(&member(), id).await,
        Err(EngineError::NotFound(Entity::Booking, _))
    ));
    assert!(matches!(
        engine.delete_booking(&member(), id).await,
        Err(EngineError::NotFound(Entity::Booking, _))
    ));
}

#[tokio::test]
async fn stranger_cannot_delete() {
    let (engine, room) = engine_with_room("delete_forbidden.wal", 1).await;
    let booking = engine
        .create_booking_at(&member(), request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();

    assert!(matches!(
        engine.delete_booking(&member(), booking.id).await,
        Err(EngineError::Forbidden)
    ));
    assert!(engine.get_booking(&admin(), booking.id).await.is_ok());
}

#[tokio::test]
async fn deleting_frees_the_slot() {
    let (engine, room) = engine_with_room("delete_frees.wal", 1).await;
    let (a, b) = (member(), member());

    let first = engine
        .create_booking_at(&a, request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();
    let blocked = engine
        .create_booking_at(&b, request(room, at(9, 30), at(10, 30)), NOW)
        .await;
    assert_conflict(blocked, ConflictReason::CapacityExceeded { capacity: 1 });

    engine.delete_booking(&a, first.id).await.unwrap();
    engine
        .create_booking_at(&b, request(room, at(9, 30), at(10, 30)), NOW)
        .await
        .unwrap();
}

#[tokio::test]
async fn deleting_lifts_the_duplicate_claim() {
    let (engine, room) = engine_with_room("delete_duplicate.wal", 3).await;
    let a = member();
    let first = engine
        .create_booking_at(&a, request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();

    // An admin removes it on the owner's behalf.
    engine.delete_booking(&admin(), first.id).await.unwrap();
    engine
        .create_booking_at(&a, request(room, at(14, 0), at(15, 0)), NOW)
        .await
        .unwrap();
}

#[tokio::test]
async fn listing_filters_by_owner_and_pages() {
    let engine = Engine::new(test_wal_path("listing.wal")).unwrap();
    let boss = admin();
    let a = member();
    let b = member();

    let mut mine = Vec::new();
    for i in 0..3 {
        let room = engine.create_room(&boss, new_room(&format!("R{i}"), 2)).await.unwrap().id;
        mine.push(
            engine
                .create_booking_at(&a, request(room, at(9, 0), at(10, 0)), NOW)
                .await
                .unwrap()
                .id,
        );
        engine
            .create_booking_at(&b, request(room, at(9, 0), at(10, 0)), NOW)
            .await
            .unwrap();
    }

    let seen: Vec<_> = engine
        .list_bookings(&a, Page::default())
        .await
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(seen, mine);
    assert_eq!(engine.list_bookings(&boss, Page::default()).await.len(), 6);

    let page = engine.list_bookings(&boss, Page::new(4, 10)).await;
    assert_eq!(page.len(), 2);
    let page = engine.list_bookings(&a, Page::new(1, 1)).await;
    assert_eq!(page.iter().map(|b| b.id).collect::<Vec<_>>(), vec![mine[1]]);
    assert!(engine.list_bookings(&member(), Page::default()).await.is_empty());
}

// ── Rooms and users ──────────────────────────────────────

#[tokio::test]
async fn members_cannot_manage_catalog() {
    let engine = Engine::new(test_wal_path("catalog_forbidden.wal")).unwrap();
    let m = member();
    assert!(matches!(
        engine.create_room(&m, new_room("Nope", 1)).await,
        Err(EngineError::Forbidden)
    ));
    let user = NewUser {
        id: Ulid::new(),
        email: "x@example.com".into(),
        name: "X".into(),
        is_admin: false,
    };
    assert!(matches!(
        engine.register_user(&m, user).await,
        Err(EngineError::Forbidden)
    ));
}

#[tokio::test]
async fn room_validation() {
    let engine = Engine::new(test_wal_path("room_validation.wal")).unwrap();
    let boss = admin();
    assert!(matches!(
        engine.create_room(&boss, new_room("Zero", 0)).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create_room(&boss, new_room(" ", 1)).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create_room(&boss, new_room(&"n".repeat(MAX_NAME_LEN + 1), 1)).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let room = new_room("Dup", 1);
    let id = room.id;
    engine.create_room(&boss, room).await.unwrap();
    let mut again = new_room("Dup again", 1);
    again.id = id;
    assert!(matches!(
        engine.create_room(&boss, again).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn capacity_change_applies_to_later_requests() {
    let (engine, room) = engine_with_room("capacity_change.wal", 2).await;
    engine
        .create_booking_at(&member(), request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();
    engine
        .create_booking_at(&member(), request(room, at(9, 0), at(10, 0)), NOW)
        .await
        .unwrap();

    let changes = RoomChanges {
        name: "Shrunk".into(),
        capacity: 1,
        location: "HQ".into(),
        amenities: String::new(),
    };
    let info = engine.update_room(&admin(), room, changes).await.unwrap();
    assert_eq!(info.capacity, 1);

    // Existing bookings survive; new overlapping ones are refused.
    assert_eq!(engine.list_bookings(&admin(), Page::default()).await.len(), 2);
    let rejected = engine
        .create_booking_at(&member(), request(room, at(9, 30), at(9, 45)), NOW)
        .await;
    assert_conflict(rejected, ConflictReason::CapacityExceeded { capacity: 1 });
}

#[tokio::test]
async fn room_listing_hides_inactive_from_members() {
    let engine = Engine::new(test_wal_path("room_listing.wal")).unwrap();
    let boss = admin();
    let b = engine.create_room(&boss, new_room("Beta", 1)).await.unwrap().id;
    engine.create_room(&boss, new_room("Alpha", 1)).await.unwrap();
    engine.set_room_active(&boss, b, false).await.unwrap();

    let names: Vec<_> = engine.list_rooms(&member()).await.into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["Alpha"]);
    let names: Vec<_> = engine.list_rooms(&boss).await.into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["Alpha", "Beta"]);
    assert!(matches!(engine.get_room(b).await, Err(EngineError::NotFound(Entity::Room, _))));
}

#[tokio::test]
async fn user_emails_are_unique_ignoring_case() {
    let engine = Engine::new(test_wal_path("user_emails.wal")).unwrap();
    let boss = admin();
    let user = NewUser {
        id: Ulid::new(),
        email: "Ana@Example.com".into(),
        name: "Ana".into(),
        is_admin: false,
    };
    let ana = engine.register_user(&boss, user).await.unwrap();

    let clash = NewUser {
        id: Ulid::new(),
        email: "ana@example.COM".into(),
        name: "Other Ana".into(),
        is_admin: false,
    };
    assert!(matches!(
        engine.register_user(&boss, clash).await,
        Err(EngineError::EmailTaken(_))
    ));

    let resolved = engine.resolve_principal("ANA@example.com").unwrap();
    assert_eq!(resolved.id(), ana.id);
    assert!(!resolved.has(crate::identity::Capability::ManageAllBookings));

    engine.set_user_active(&boss, ana.id, false).await.unwrap();
    assert!(engine.resolve_principal("ana@example.com").is_none());
    assert!(engine.get_user(ana.id).is_some());
}

#[tokio::test]
async fn malformed_email_is_rejected() {
    let engine = Engine::new(test_wal_path("bad_email.wal")).unwrap();
    let user = NewUser {
        id: Ulid::new(),
        email: "not-an-email".into(),
        name: "N".into(),
        is_admin: false,
    };
    assert!(matches!(
        engine.register_user(&admin(), user).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn ensure_admin_is_idempotent() {
    let path = test_wal_path("ensure_admin.wal");
    let engine = Engine::new(path.clone()).unwrap();
    let first = engine.ensure_admin("root@example.com", "Root").await.unwrap();
    assert!(first.is_admin);
    let second = engine.ensure_admin("ROOT@example.com", "Root").await.unwrap();
    assert_eq!(first.id, second.id);

    drop(engine);
    let engine = Engine::new(path).unwrap();
    let again = engine.ensure_admin("root@example.com", "Root").await.unwrap();
    assert_eq!(first.id, again.id);
    assert!(engine.resolve_principal("root@example.com").unwrap().has(crate::identity::Capability::ManageRooms));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let boss = admin();
    let a = member();
    let (room, kept, deleted);
    {
        let engine = Engine::new(path.clone()).unwrap();
        room = engine.create_room(&boss, new_room("Replay", 1)).await.unwrap().id;
        deleted = engine
            .create_booking_at(&a, request(room, at(9, 0), at(10, 0)), NOW)
            .await
            .unwrap();
        engine.delete_booking(&a, deleted.id).await.unwrap();
        kept = engine
            .create_booking_at(&a, request(room, at(11, 0), at(12, 0)), NOW)
            .await
            .unwrap();
    }

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.get_booking(&a, kept.id).await.unwrap(), kept);
    assert!(engine.get_booking(&a, deleted.id).await.is_err());
    // The restored booking still holds the room and the user's claim.
    let rejected = engine
        .create_booking_at(&member(), request(room, at(11, 30), at(12, 30)), NOW)
        .await;
    assert_conflict(rejected, ConflictReason::CapacityExceeded { capacity: 1 });
    let rejected = engine
        .create_booking_at(&a, request(room, at(15, 0), at(16, 0)), NOW)
        .await;
    assert_conflict(rejected, ConflictReason::DuplicateActiveBooking);
}

#[tokio::test]
async fn bookings_after_a_torn_tail_survive_the_next_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_restart.wal");
    let a = member();
    let room;
    {
        let engine = Engine::new(path.clone()).unwrap();
        room = engine.create_room(&admin(), new_room("Torn", 1)).await.unwrap().id;
    }
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7u8, 0, 0, 0, 1, 2, 3]).unwrap();
    }

    let booking;
    {
        let engine = Engine::new(path.clone()).unwrap();
        booking = engine
            .create_booking_at(&a, request(room, at(9, 0), at(10, 0)), NOW)
            .await
            .unwrap();
    }

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.get_booking(&a, booking.id).await.unwrap(), booking);
    let rejected = engine
        .create_booking_at(&member(), request(room, at(9, 30), at(10, 30)), NOW)
        .await;
    assert_conflict(rejected, ConflictReason::CapacityExceeded { capacity: 1 });
}

#[tokio::test]
async fn listing_order_survives_compaction_and_restart() {
    let path = test_wal_path("order_restart.wal");
    let boss = admin();
    let mut admitted = Vec::new();
    {
        let engine = Engine::new(path.clone()).unwrap();
        let mut rooms = Vec::new();
        for name in ["Zeta", "Alpha", "Mu"] {
            rooms.push(engine.create_room(&boss, new_room(name, 10)).await.unwrap().id);
        }
        // Same millisecond, rooms visited out of id order.
        for round in 0..3 {
            for &room in rooms.iter().rev() {
                let user = member();
                let req = request(room, at(9 + round, 0), at(10 + round, 0));
                admitted.push(engine.create_booking_at(&user, req, NOW).await.unwrap().id);
            }
        }
        engine.compact_wal().await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let room = engine.list_rooms(&boss).await[0].id;
    admitted.push(
        engine
            .create_booking_at(&member(), request(room, at(20, 0), at(21, 0)), NOW)
            .await
            .unwrap()
            .id,
    );
    let listed: Vec<_> = engine
        .list_bookings(&boss, Page::default())
        .await
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(listed, admitted);
}

#[tokio::test]
async fn dropped_request_leaves_memory_and_wal_in_step() {
    let path = test_wal_path("dropped_request.wal");
    let a = member();
    let room;
    let req = {
        let engine = Engine::new(path.clone()).unwrap();
        room = engine.create_room(&admin(), new_room("Dropped", 1)).await.unwrap().id;
        let req = request(room, at(9, 0), at(10, 0));
        let id = req.id;
        // Polled once, then abandoned while the WAL write is in flight.
        let _ = tokio::time::timeout(
            std::time::Duration::ZERO,
            engine.create_booking_at(&a, req, NOW),
        )
        .await;
        // The room lock is released only after the apply.
        engine.get_room(room).await.unwrap();
        let in_memory = engine.get_booking(&a, id).await.is_ok();

        let restarted = Engine::new(path.clone()).unwrap();
        assert_eq!(restarted.get_booking(&a, id).await.is_ok(), in_memory);
        id
    };

    let engine = Engine::new(path).unwrap();
    if engine.get_booking(&a, req).await.is_ok() {
        let again = engine
            .create_booking_at(&a, request(room, at(11, 0), at(12, 0)), NOW)
            .await;
        assert_conflict(again, ConflictReason::DuplicateActiveBooking);
    }
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let boss = admin();
    let a = member();
    let (active_room, closed_room, booking, user);
    {
        let engine = Engine::new(path.clone()).unwrap();
        active_room = engine.create_room(&boss, new_room("Open", 2)).await.unwrap().id;
        closed_room = engine.create_room(&boss, new_room("Closed", 2)).await.unwrap().id;
        engine.set_room_active(&boss, closed_room, false).await.unwrap();
        user = engine
            .register_user(
                &boss,
                NewUser {
                    id: Ulid::new(),
                    email: "gone@example.com".into(),
                    name: "Gone".into(),
                    is_admin: false,
                },
            )
            .await
            .unwrap();
        engine.set_user_active(&boss, user.id, false).await.unwrap();
        for _ in 0..5 {
            let b = engine
                .create_booking_at(&a, request(active_room, at(9, 0), at(10, 0)), NOW)
                .await
                .unwrap();
            engine.delete_booking(&a, b.id).await.unwrap();
        }
        booking = engine
            .create_booking_at(&a, request(active_room, at(9, 0), at(10, 0)), NOW)
            .await
            .unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() < before);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.get_booking(&a, booking.id).await.unwrap(), booking);
    assert!(engine.get_room(active_room).await.is_ok());
    assert!(engine.get_room(closed_room).await.is_err());
    assert_eq!(engine.list_rooms(&boss).await.len(), 2);
    assert!(!engine.get_user(user.id).unwrap().is_active);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());
    let boss = admin();

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_room(&boss, new_room(&format!("R{i}"), 1)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_rooms(&boss).await.len(), n);
    assert_eq!(engine.wal_appends_since_compact().await, n as u64);

    let engine2 = Engine::new(path).unwrap();
    assert_eq!(engine2.list_rooms(&boss).await.len(), n);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_overfill_a_room() {
    let (engine, room) = engine_with_room("concurrent_capacity.wal", 3).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..32 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_booking_at(&member(), request(room, at(9, 0), at(10, 0)), NOW)
                .await
        }));
    }

    let mut admitted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert!(matches!(
                e,
                EngineError::Conflict(ConflictReason::CapacityExceeded { capacity: 3 })
            )),
        }
    }
    assert_eq!(admitted, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_from_one_user_admit_one() {
    let (engine, room) = engine_with_room("concurrent_duplicate.wal", 10).await;
    let engine = Arc::new(engine);
    let a = member();

    let mut handles = Vec::new();
    for i in 0..16 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_booking_at(&a, request(room, at(i, 0), at(i, 30)), NOW)
                .await
        }));
    }

    let mut admitted = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}

/// Max number of spans covering any single instant.
fn peak_concurrency(spans: &[Span]) -> usize {
    let mut edges: Vec<(Ms, i32)> = spans
        .iter()
        .flat_map(|s| [(s.start, 1), (s.end, -1)])
        .collect();
    // Ends sort before starts at the same instant: half-open spans.
    edges.sort();
    let mut live = 0i32;
    let mut peak = 0i32;
    for (_, delta) in edges {
        live += delta;
        peak = peak.max(live);
    }
    peak as usize
}

#[tokio::test]
async fn random_requests_respect_both_invariants() {
    let boss = admin();
    let engine = Engine::new(test_wal_path("random_invariants.wal")).unwrap();
    let mut rooms = Vec::new();
    for capacity in 1..=4 {
        rooms.push(engine.create_room(&boss, new_room(&format!("C{capacity}"), capacity)).await.unwrap());
    }
    let users: Vec<Requester> = (0..12).map(|_| member()).collect();

    // Deterministic LCG so failures reproduce.
    let mut seed: u64 = 0x5eed;
    let mut next = move |bound: u64| {
        seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        (seed >> 33) % bound
    };

    for _ in 0..400 {
        let room = &rooms[next(rooms.len() as u64) as usize];
        let user = &users[next(users.len() as u64) as usize];
        let start = at(8, 0) + next(40) as Ms * 15 * M;
        let end = start + (1 + next(8) as Ms) * 15 * M;
        let _ = engine.create_booking_at(user, request(room.id, start, end), NOW).await;

        if next(5) == 0 {
            let all = engine.list_bookings(&boss, Page::new(0, MAX_PAGE_LIMIT)).await;
            if !all.is_empty() {
                let victim = &all[next(all.len() as u64) as usize];
                engine.delete_booking(&boss, victim.id).await.unwrap();
            }
        }
    }

    let all = engine.list_bookings(&boss, Page::new(0, MAX_PAGE_LIMIT)).await;
    assert!(!all.is_empty());
    for room in &rooms {
        let spans: Vec<Span> = all.iter().filter(|b| b.room_id == room.id).map(|b| b.span).collect();
        assert!(peak_concurrency(&spans) <= room.capacity as usize, "room {} overfilled", room.name);

        for user in &users {
            let active = all
                .iter()
                .filter(|b| b.room_id == room.id && b.user_id == user.id() && b.span.is_active_at(NOW))
                .count();
            assert!(active <= 1);
        }
    }
}
