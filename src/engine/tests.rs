use std::path::PathBuf;

use chrono::Duration;
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::limits::*;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomshare_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

async fn register(engine: &Engine, role: Role) -> Principal {
    let id = Ulid::new();
    engine
        .register_user(id, format!("user {id}"), format!("{id}@example.com"), role)
        .await
        .unwrap();
    engine.principal_for(&id).unwrap()
}

/// A host with one property holding one room of the given capacity.
async fn host_with_room(engine: &Engine, capacity: u32) -> (Principal, Ulid, Ulid) {
    let host = register(engine, Role::Host).await;
    let property_id = Ulid::new();
    engine
        .create_property(&host, property_id, "Maple House".into(), Some("Leeds".into()))
        .await
        .unwrap();
    let room_id = Ulid::new();
    engine
        .create_room(&host, room_id, property_id, Some("A".into()), capacity)
        .await
        .unwrap();
    (host, property_id, room_id)
}

async fn submit(
    engine: &Engine,
    resident: &Principal,
    room_id: Ulid,
    move_in: Timestamp,
    months: u32,
) -> Ulid {
    let id = Ulid::new();
    engine
        .submit_request(resident, id, room_id, move_in, months)
        .await
        .unwrap();
    id
}

async fn request_of(engine: &Engine, request_id: Ulid) -> BookingRequest {
    let room_id = engine.get_room_for_entity(&request_id).unwrap();
    let rs = engine.get_room(&room_id).unwrap();
    let guard = rs.read().await;
    guard.request(request_id).unwrap().clone()
}

async fn room_of(engine: &Engine, room_id: Ulid) -> RoomState {
    engine.get_room(&room_id).unwrap().read().await.clone()
}

// ── Registration & ownership ─────────────────────────────

#[tokio::test]
async fn email_is_unique_ignoring_case() {
    let engine = new_engine("email_unique.wal");
    engine
        .register_user(Ulid::new(), "Ann".into(), "ann@example.com".into(), Role::Resident)
        .await
        .unwrap();
    let result = engine
        .register_user(Ulid::new(), "Ann 2".into(), " ANN@example.com".into(), Role::Resident)
        .await;
    assert!(matches!(result, Err(EngineError::EmailTaken(_))));
}

#[tokio::test]
async fn register_rejects_duplicate_id_and_bad_email() {
    let engine = new_engine("register_dup.wal");
    let id = Ulid::new();
    assert_ok!(
        engine
            .register_user(id, "Bo".into(), "bo@example.com".into(), Role::Host)
            .await
    );
    assert!(matches!(
        engine
            .register_user(id, "Bo".into(), "bo2@example.com".into(), Role::Host)
            .await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine
            .register_user(Ulid::new(), "Cy".into(), "not-an-email".into(), Role::Host)
            .await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine
            .register_user(Ulid::new(), "x".repeat(MAX_NAME_LEN + 1), "cy@example.com".into(), Role::Host)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn only_hosts_create_properties() {
    let engine = new_engine("host_only_property.wal");
    let resident = register(&engine, Role::Resident).await;
    let result = engine
        .create_property(&resident, Ulid::new(), "Nope".into(), None)
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
}

#[tokio::test]
async fn rooms_belong_to_property_owner() {
    let engine = new_engine("room_owner.wal");
    let (_, property_id, room_id) = host_with_room(&engine, 2).await;
    let other_host = register(&engine, Role::Host).await;

    assert!(matches!(
        engine
            .create_room(&other_host, Ulid::new(), property_id, None, 1)
            .await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.update_room(&other_host, room_id, None, Some(3)).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.delete_room(&other_host, room_id).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn hosts_list_and_edit_their_properties() {
    let engine = new_engine("property_edit.wal");
    let (host, property_id, _) = host_with_room(&engine, 2).await;
    let (other_host, other_property, _) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;

    let listed = engine.list_properties(&host).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].property.id, property_id);
    assert_eq!(listed[0].room_count, 1);
    assert!(matches!(
        engine.list_properties(&resident),
        Err(EngineError::Forbidden(_))
    ));

    engine
        .update_property(&host, property_id, Some("Oak Lodge".into()), None)
        .await
        .unwrap();
    let details = engine.property_details(&host, property_id).unwrap();
    assert_eq!(details.property.name, "Oak Lodge");
    assert_eq!(details.property.city.as_deref(), Some("Leeds"));

    assert!(matches!(
        engine.property_details(&host, other_property),
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine
            .update_property(&other_host, property_id, Some("Mine".into()), None)
            .await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.update_property(&host, Ulid::new(), None, None).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn profile_edit_keeps_email_unique() {
    let engine = new_engine("profile_edit.wal");
    let ann = register(&engine, Role::Resident).await;
    let bo = register(&engine, Role::Host).await;
    let bo_email = engine.profile(&bo).unwrap().email;

    assert!(matches!(
        engine
            .update_profile(&ann, ann.user_id, None, Some(bo_email.to_uppercase()))
            .await,
        Err(EngineError::EmailTaken(_))
    ));
    assert!(matches!(
        engine
            .update_profile(&ann, bo.user_id, Some("Not me".into()), None)
            .await,
        Err(EngineError::Forbidden(_))
    ));

    engine
        .update_profile(&ann, ann.user_id, Some("Ann Lee".into()), Some("ann@example.com".into()))
        .await
        .unwrap();
    let profile = engine.profile(&ann).unwrap();
    assert_eq!(profile.name, "Ann Lee");
    assert_eq!(profile.email, "ann@example.com");
    assert_eq!(profile.role, Role::Resident);

    // The old address is free again; the new one is taken.
    assert_ok!(
        engine
            .register_user(Ulid::new(), "Cy".into(), format!("{}@example.com", ann.user_id), Role::Guardian)
            .await
    );
    assert_err!(
        engine
            .register_user(Ulid::new(), "Di".into(), "ANN@example.com".into(), Role::Guardian)
            .await
    );
    // Keeping your own address is not a conflict.
    assert_ok!(
        engine
            .update_profile(&ann, ann.user_id, None, Some("Ann@Example.com".into()))
            .await
    );
}

#[tokio::test]
async fn create_room_validates_capacity() {
    let engine = new_engine("room_capacity.wal");
    let (host, property_id, _) = host_with_room(&engine, 1).await;
    assert!(matches!(
        engine.create_room(&host, Ulid::new(), property_id, None, 0).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine
            .create_room(&host, Ulid::new(), Ulid::new(), None, 1)
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn new_room_is_available() {
    let engine = new_engine("new_room_available.wal");
    let (_, _, room_id) = host_with_room(&engine, 1).await;
    assert!(room_of(&engine, room_id).await.room.is_available);
}

// ── Requests ─────────────────────────────────────────────

#[tokio::test]
async fn submitted_request_is_pending_for_a_day() {
    let engine = new_engine("submit_ttl.wal");
    let (_, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;

    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(30), 6).await;
    let req = request_of(&engine, id).await;
    assert_eq!(req.status, BookingStatus::Pending);
    assert_eq!(req.resident_id, resident.user_id);
    assert_eq!(req.expires_at - req.created_at, Duration::hours(REQUEST_TTL_HOURS));
}

#[tokio::test]
async fn submit_validates_months_and_role() {
    let engine = new_engine("submit_validate.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let move_in = dates::now() + Duration::days(10);

    for months in [0, 37] {
        assert!(matches!(
            engine
                .submit_request(&resident, Ulid::new(), room_id, move_in, months)
                .await,
            Err(EngineError::InvalidArgument(_))
        ));
    }
    assert!(matches!(
        engine
            .submit_request(&host, Ulid::new(), room_id, move_in, 6)
            .await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine
            .submit_request(&resident, Ulid::new(), Ulid::new(), move_in, 6)
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn approval_creates_accepted_occupancy() {
    let engine = new_engine("approve_creates.wal");
    let (host, _, room_id) = host_with_room(&engine, 2).await;
    let resident = register(&engine, Role::Resident).await;
    let move_in = dates::now() + Duration::days(30);
    let id = submit(&engine, &resident, room_id, move_in, 6).await;

    let occupancy_id = engine.approve_request(&host, id).await.unwrap();

    let req = request_of(&engine, id).await;
    assert_eq!(req.status, BookingStatus::Accepted);
    assert_eq!(
        req.note.as_deref(),
        Some("Your request for room A at Maple House was accepted.")
    );

    let state = room_of(&engine, room_id).await;
    assert_eq!(state.occupancies.len(), 1);
    let o = &state.occupancies[0];
    assert_eq!(o.id, occupancy_id);
    assert_eq!(o.user_id, resident.user_id);
    assert_eq!(o.request_id, Some(id));
    assert_eq!(o.status, OccupancyStatus::Accepted);
    assert_eq!(o.joined_at, Some(move_in));
    assert_eq!(o.exit_date, dates::add_months(move_in, 6));
    assert!(!o.is_active);
    assert_eq!(engine.get_room_for_entity(&occupancy_id), Some(room_id));
}

#[tokio::test]
async fn approval_of_started_stay_is_active() {
    let engine = new_engine("approve_active.wal");
    let (host, _, room_id) = host_with_room(&engine, 2).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() - Duration::days(1), 3).await;

    engine.approve_request(&host, id).await.unwrap();
    let state = room_of(&engine, room_id).await;
    assert!(state.occupancies[0].is_active);
}

#[tokio::test]
async fn saturated_window_leaves_request_pending() {
    let engine = new_engine("approve_saturated.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let first = register(&engine, Role::Resident).await;
    let second = register(&engine, Role::Resident).await;
    let move_in = dates::now() + Duration::days(30);

    let a = submit(&engine, &first, room_id, move_in, 6).await;
    let b = submit(&engine, &second, room_id, move_in + Duration::days(60), 6).await;
    engine.approve_request(&host, a).await.unwrap();

    match engine.approve_request(&host, b).await {
        Err(EngineError::CapacityExceeded { capacity, conflicts }) => {
            assert_eq!(capacity, 1);
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].user_id, first.user_id);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
    assert_eq!(request_of(&engine, b).await.status, BookingStatus::Pending);
    assert_eq!(room_of(&engine, room_id).await.occupancies.len(), 1);
}

#[tokio::test]
async fn back_to_back_stays_share_a_bed() {
    let engine = new_engine("approve_back_to_back.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let first = register(&engine, Role::Resident).await;
    let second = register(&engine, Role::Resident).await;
    let move_in = dates::now() + Duration::days(30);
    let next = dates::add_months(move_in, 3).unwrap();

    let a = submit(&engine, &first, room_id, move_in, 3).await;
    let b = submit(&engine, &second, room_id, next, 3).await;
    assert_ok!(engine.approve_request(&host, a).await);
    assert_ok!(engine.approve_request(&host, b).await);
}

#[tokio::test]
async fn approving_twice_is_invalid_transition() {
    let engine = new_engine("approve_twice.wal");
    let (host, _, room_id) = host_with_room(&engine, 2).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(5), 1).await;

    engine.approve_request(&host, id).await.unwrap();
    assert!(matches!(
        engine.approve_request(&host, id).await,
        Err(EngineError::InvalidTransition { status: "accepted", .. })
    ));
    assert!(matches!(
        engine.decline_request(&host, id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn only_owning_host_decides() {
    let engine = new_engine("approve_owner.wal");
    let (_, _, room_id) = host_with_room(&engine, 1).await;
    let other_host = register(&engine, Role::Host).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(5), 1).await;

    assert!(matches!(
        engine.approve_request(&other_host, id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.approve_request(&resident, id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.approve_request(&other_host, Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn decline_sets_note() {
    let engine = new_engine("decline_note.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(5), 1).await;

    assert_eq!(engine.decline_request(&host, id).await.unwrap(), room_id);
    let req = request_of(&engine, id).await;
    assert_eq!(req.status, BookingStatus::Declined);
    assert_eq!(
        req.note.as_deref(),
        Some("Your request for room A at Maple House was declined.")
    );
    assert!(room_of(&engine, room_id).await.occupancies.is_empty());
}

#[tokio::test]
async fn concurrent_approvals_take_last_bed_once() {
    let engine = Arc::new(new_engine("approve_concurrent.wal"));
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let move_in = dates::now() + Duration::days(30);

    let mut ids = Vec::new();
    for _ in 0..8 {
        let resident = register(&engine, Role::Resident).await;
        ids.push(submit(&engine, &resident, room_id, move_in, 6).await);
    }

    let mut handles = Vec::new();
    for id in ids {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.approve_request(&host, id).await }));
    }
    let mut approved = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => approved += 1,
            Err(EngineError::CapacityExceeded { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(approved, 1);
    assert_eq!(room_of(&engine, room_id).await.occupancies.len(), 1);
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn last_bed_flips_availability_until_departure() {
    let engine = new_engine("availability_flip.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() - Duration::days(1), 6).await;

    let occupancy_id = engine.approve_request(&host, id).await.unwrap();
    assert!(!room_of(&engine, room_id).await.room.is_available);
    assert!(engine.list_rooms(None, true).await.is_empty());

    engine.record_departure(&host, occupancy_id).await.unwrap();
    let state = room_of(&engine, room_id).await;
    assert!(state.room.is_available);
    let o = &state.occupancies[0];
    assert_eq!(o.status, OccupancyStatus::Left);
    assert!(!o.is_active);
    assert!(o.exit_date.unwrap() <= dates::now());
}

#[tokio::test]
async fn future_booking_blocks_availability() {
    let engine = new_engine("availability_future.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(60), 6).await;
    engine.approve_request(&host, id).await.unwrap();

    let info = engine.room_availability(room_id, dates::now()).await.unwrap();
    assert_eq!(info.current, 0);
    assert_eq!(info.upcoming, 1);
    assert!(!info.available);
}

#[tokio::test]
async fn raising_capacity_reopens_room() {
    let engine = new_engine("availability_capacity.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(3), 2).await;
    engine.approve_request(&host, id).await.unwrap();
    assert!(!room_of(&engine, room_id).await.room.is_available);

    engine
        .update_room(&host, room_id, Some("A+".into()), Some(2))
        .await
        .unwrap();
    let state = room_of(&engine, room_id).await;
    assert!(state.room.is_available);
    assert_eq!(state.room.capacity, 2);
    assert_eq!(state.room.label.as_deref(), Some("A+"));
}

#[tokio::test]
async fn departure_requires_committed_stay() {
    let engine = new_engine("departure_twice.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() - Duration::days(2), 1).await;
    let occupancy_id = engine.approve_request(&host, id).await.unwrap();

    assert_ok!(engine.record_departure(&host, occupancy_id).await);
    let err = engine.record_departure(&host, occupancy_id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { status: "left", expected: "accepted", .. }
    ));
    assert!(err.to_string().ends_with("is left, expected accepted"));
}

// ── Deletion ─────────────────────────────────────────────

#[tokio::test]
async fn room_with_occupants_cannot_be_deleted() {
    let engine = new_engine("delete_occupied.wal");
    let (host, property_id, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(3), 2).await;
    let occupancy_id = engine.approve_request(&host, id).await.unwrap();

    assert!(matches!(
        engine.delete_room(&host, room_id).await,
        Err(EngineError::HasOccupants(_))
    ));

    engine.record_departure(&host, occupancy_id).await.unwrap();
    engine.delete_room(&host, room_id).await.unwrap();
    assert!(engine.get_room(&room_id).is_none());
    assert!(engine.get_room_for_entity(&id).is_none());
    assert!(engine.get_room_for_entity(&occupancy_id).is_none());
    assert!(engine.list_rooms(Some(property_id), false).await.is_empty());
}

// ── Time-driven transitions ──────────────────────────────

#[tokio::test]
async fn stale_request_expires() {
    let engine = new_engine("expire_request.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(5), 1).await;

    assert!(engine.collect_expired_requests(dates::now()).is_empty());
    assert!(matches!(
        engine.expire_request(id, dates::now()).await,
        Err(EngineError::InvalidArgument(_))
    ));

    let later = dates::now() + Duration::hours(REQUEST_TTL_HOURS + 1);
    assert_eq!(engine.collect_expired_requests(later), vec![id]);
    engine.expire_request(id, later).await.unwrap();
    assert_eq!(request_of(&engine, id).await.status, BookingStatus::Expired);
    assert!(matches!(
        engine.approve_request(&host, id).await,
        Err(EngineError::InvalidTransition { status: "expired", .. })
    ));
}

#[tokio::test]
async fn move_in_and_move_out_transitions() {
    let engine = new_engine("move_in_out.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let move_in = dates::now() + Duration::days(2);
    let id = submit(&engine, &resident, room_id, move_in, 1).await;
    let occupancy_id = engine.approve_request(&host, id).await.unwrap();

    assert!(engine.collect_due_move_ins(dates::now()).is_empty());
    let moved_in = move_in + Duration::days(1);
    assert_eq!(engine.collect_due_move_ins(moved_in), vec![occupancy_id]);
    assert_err!(engine.activate_occupancy(occupancy_id, dates::now()).await);
    engine.activate_occupancy(occupancy_id, moved_in).await.unwrap();
    assert!(room_of(&engine, room_id).await.occupancies[0].is_active);

    let exit = dates::add_months(move_in, 1).unwrap();
    assert!(engine.collect_due_move_outs(moved_in).is_empty());
    assert_eq!(engine.collect_due_move_outs(exit), vec![occupancy_id]);
    engine.end_occupancy(occupancy_id, exit).await.unwrap();

    let state = room_of(&engine, room_id).await;
    let o = &state.occupancies[0];
    assert_eq!(o.status, OccupancyStatus::Left);
    assert_eq!(o.exit_date, Some(exit));
    assert!(!o.is_active);
}

#[tokio::test]
async fn stay_that_never_moved_in_still_settles() {
    let engine = new_engine("never_active.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let move_in = dates::now() - Duration::days(400);
    let id = submit(&engine, &resident, room_id, move_in, 1).await;
    let occupancy_id = engine.approve_request(&host, id).await.unwrap();

    let now = dates::now();
    assert!(!room_of(&engine, room_id).await.occupancies[0].is_active);
    assert!(engine.collect_due_move_ins(now).is_empty());
    assert_eq!(engine.collect_due_move_outs(now), vec![occupancy_id]);
    engine.end_occupancy(occupancy_id, now).await.unwrap();

    let state = room_of(&engine, room_id).await;
    let o = &state.occupancies[0];
    assert_eq!(o.status, OccupancyStatus::Left);
    assert_eq!(o.exit_date, dates::add_months(move_in, 1));
    assert_eq!(engine.room_roster(room_id, now).await.unwrap().past.len(), 1);
    assert_ok!(engine.delete_room(&host, room_id).await);
}

#[tokio::test]
async fn ending_unfinished_stay_is_rejected() {
    let engine = new_engine("end_too_early.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(5), 2).await;
    let occupancy_id = engine.approve_request(&host, id).await.unwrap();

    assert!(matches!(
        engine.end_occupancy(occupancy_id, dates::now()).await,
        Err(EngineError::InvalidArgument(_))
    ));
    engine.record_departure(&host, occupancy_id).await.unwrap();
    assert!(matches!(
        engine.end_occupancy(occupancy_id, dates::now()).await,
        Err(EngineError::InvalidTransition { status: "left", expected: "accepted", .. })
    ));
}

#[tokio::test]
async fn departure_before_move_in_keeps_span_ordered() {
    let engine = new_engine("departure_future.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let move_in = dates::now() + Duration::days(20);
    let id = submit(&engine, &resident, room_id, move_in, 3).await;
    let occupancy_id = engine.approve_request(&host, id).await.unwrap();

    engine.record_departure(&host, occupancy_id).await.unwrap();
    let state = room_of(&engine, room_id).await;
    let o = &state.occupancies[0];
    assert_eq!(o.status, OccupancyStatus::Left);
    assert_eq!(o.exit_date, Some(move_in));
    assert!(o.exit_date >= o.joined_at);
    assert!(state.room.is_available);
}

// ── Views ────────────────────────────────────────────────

#[tokio::test]
async fn requests_are_scoped_to_principal() {
    let engine = new_engine("requests_for.wal");
    let (host, property_id, room_id) = host_with_room(&engine, 3).await;
    let (other_host, _, other_room) = host_with_room(&engine, 3).await;
    let ann = register(&engine, Role::Resident).await;
    let bo = register(&engine, Role::Resident).await;
    let move_in = dates::now() + Duration::days(10);

    let first = submit(&engine, &ann, room_id, move_in, 1).await;
    let second = submit(&engine, &ann, other_room, move_in, 1).await;
    let third = submit(&engine, &bo, room_id, move_in, 1).await;
    engine.approve_request(&host, third).await.unwrap();

    let mine: Vec<Ulid> = engine
        .requests_for(&ann, None, None)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(mine, vec![second, first]);

    let hosted: Vec<Ulid> = engine
        .requests_for(&host, Some(property_id), None)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(hosted, vec![third, first]);

    assert_eq!(engine.pending_count(&host).await.unwrap(), 1);
    assert_eq!(engine.pending_count(&other_host).await.unwrap(), 1);
    assert_eq!(
        engine
            .requests_for(&host, None, Some(BookingStatus::Accepted))
            .await
            .unwrap()
            .len(),
        1
    );

    let guardian = register(&engine, Role::Guardian).await;
    assert_err!(engine.requests_for(&guardian, None, None).await);
}

#[tokio::test]
async fn roster_splits_stays() {
    let engine = new_engine("roster.wal");
    let (host, _, room_id) = host_with_room(&engine, 3).await;
    let now = dates::now();
    let present = register(&engine, Role::Resident).await;
    let coming = register(&engine, Role::Resident).await;
    let gone = register(&engine, Role::Resident).await;

    let a = submit(&engine, &present, room_id, now - Duration::days(10), 6).await;
    let b = submit(&engine, &coming, room_id, now + Duration::days(10), 6).await;
    let c = submit(&engine, &gone, room_id, now - Duration::days(20), 6).await;
    engine.approve_request(&host, a).await.unwrap();
    engine.approve_request(&host, b).await.unwrap();
    let left = engine.approve_request(&host, c).await.unwrap();
    engine.record_departure(&host, left).await.unwrap();

    let roster = engine.room_roster(room_id, dates::now()).await.unwrap();
    assert_eq!(roster.current.len(), 1);
    assert_eq!(roster.current[0].user_id, present.user_id);
    assert_eq!(roster.upcoming.len(), 1);
    assert_eq!(roster.upcoming[0].user_id, coming.user_id);
    assert_eq!(roster.past.len(), 1);
    assert_eq!(roster.past[0].user_id, gone.user_id);
}

// ── Guardian links ───────────────────────────────────────

#[tokio::test]
async fn guardian_link_lifecycle() {
    let engine = new_engine("guardian_link.wal");
    let guardian = register(&engine, Role::Guardian).await;
    let resident = register(&engine, Role::Resident).await;
    let link_id = Ulid::new();

    engine
        .request_guardian_link(&guardian, link_id, resident.user_id)
        .await
        .unwrap();
    assert!(matches!(
        engine
            .request_guardian_link(&resident, Ulid::new(), guardian.user_id)
            .await,
        Err(EngineError::AlreadyExists(id)) if id == link_id
    ));
    assert!(matches!(
        engine.respond_guardian_link(&guardian, link_id, true).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.stay_status(&guardian, resident.user_id, dates::now()).await,
        Err(EngineError::Forbidden(_))
    ));

    engine
        .respond_guardian_link(&resident, link_id, true)
        .await
        .unwrap();
    let links = engine.guardian_links(&guardian);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].status, LinkStatus::Accepted);
    assert!(links[0].responded_at.is_some());
    assert_ok!(engine.stay_status(&guardian, resident.user_id, dates::now()).await);

    assert!(matches!(
        engine.respond_guardian_link(&resident, link_id, false).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn guardian_link_needs_complementary_roles() {
    let engine = new_engine("guardian_roles.wal");
    let guardian = register(&engine, Role::Guardian).await;
    let other_guardian = register(&engine, Role::Guardian).await;
    let host = register(&engine, Role::Host).await;

    assert!(matches!(
        engine
            .request_guardian_link(&guardian, Ulid::new(), other_guardian.user_id)
            .await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine
            .request_guardian_link(&host, Ulid::new(), guardian.user_id)
            .await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine
            .request_guardian_link(&guardian, Ulid::new(), Ulid::new())
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn declined_link_can_be_requested_again() {
    let engine = new_engine("guardian_retry.wal");
    let guardian = register(&engine, Role::Guardian).await;
    let resident = register(&engine, Role::Resident).await;
    let first = Ulid::new();
    engine
        .request_guardian_link(&guardian, first, resident.user_id)
        .await
        .unwrap();
    engine
        .respond_guardian_link(&resident, first, false)
        .await
        .unwrap();
    assert_ok!(
        engine
            .request_guardian_link(&guardian, Ulid::new(), resident.user_id)
            .await
    );
}

#[tokio::test]
async fn stay_status_lists_roommates() {
    let engine = new_engine("stay_status.wal");
    let (host, _, room_id) = host_with_room(&engine, 3).await;
    let now = dates::now();
    let ann = register(&engine, Role::Resident).await;
    let bo = register(&engine, Role::Resident).await;
    let cy = register(&engine, Role::Resident).await;

    let a = submit(&engine, &ann, room_id, now - Duration::days(30), 6).await;
    let b = submit(&engine, &bo, room_id, now - Duration::days(5), 6).await;
    let c = submit(&engine, &cy, room_id, now + Duration::days(5), 6).await;
    for id in [a, b, c] {
        engine.approve_request(&host, id).await.unwrap();
    }

    let status = engine.stay_status(&ann, ann.user_id, dates::now()).await.unwrap();
    assert_eq!(status.current.map(|o| o.room_id), Some(room_id));
    assert_eq!(status.roommates, vec![bo.user_id]);
    assert!(status.past.is_empty());

    assert!(matches!(
        engine.stay_status(&bo, ann.user_id, dates::now()).await,
        Err(EngineError::Forbidden(_))
    ));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_replay() {
    let path = test_wal_path("replay.wal");
    let notify = Arc::new(NotifyHub::new());
    let move_in = dates::now() + Duration::days(20);

    let (host, room_id, accepted, pending, link_id, guardian) = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let (host, property_id, room_id) = host_with_room(&engine, 1).await;
        engine
            .update_property(&host, property_id, None, Some("York".into()))
            .await
            .unwrap();
        engine
            .update_profile(&host, host.user_id, Some("Hana Park".into()), None)
            .await
            .unwrap();
        let resident = register(&engine, Role::Resident).await;
        let guardian = register(&engine, Role::Guardian).await;
        let accepted = submit(&engine, &resident, room_id, move_in, 6).await;
        let pending = submit(&engine, &resident, room_id, move_in, 6).await;
        engine.approve_request(&host, accepted).await.unwrap();
        let link_id = Ulid::new();
        engine
            .request_guardian_link(&guardian, link_id, resident.user_id)
            .await
            .unwrap();
        (host, room_id, accepted, pending, link_id, guardian)
    };

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(engine.principal_for(&host.user_id), Some(host));
    assert_eq!(engine.profile(&host).unwrap().name, "Hana Park");
    let properties = engine.list_properties(&host).unwrap();
    assert_eq!(properties[0].property.city.as_deref(), Some("York"));
    let state = room_of(&engine, room_id).await;
    assert!(!state.room.is_available);
    assert_eq!(state.occupancies.len(), 1);
    assert_eq!(state.occupancies[0].request_id, Some(accepted));
    assert_eq!(request_of(&engine, accepted).await.status, BookingStatus::Accepted);
    assert_eq!(request_of(&engine, pending).await.status, BookingStatus::Pending);
    assert_eq!(engine.guardian_links(&guardian)[0].id, link_id);

    // Ownership and the room index came back too.
    assert!(matches!(
        engine.approve_request(&host, pending).await,
        Err(EngineError::CapacityExceeded { .. })
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let notify = Arc::new(NotifyHub::new());
    let now = dates::now();

    let (room_id, left, declined, resident) = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let (host, _, room_id) = host_with_room(&engine, 2).await;
        let resident = register(&engine, Role::Resident).await;
        let a = submit(&engine, &resident, room_id, now - Duration::days(40), 6).await;
        let b = submit(&engine, &resident, room_id, now + Duration::days(40), 6).await;
        let left = engine.approve_request(&host, a).await.unwrap();
        engine.record_departure(&host, left).await.unwrap();
        engine.decline_request(&host, b).await.unwrap();
        engine
            .update_room(&host, room_id, None, Some(3))
            .await
            .unwrap();

        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (room_id, left, b, resident)
    };

    let engine = Engine::new(path, notify).unwrap();
    let state = room_of(&engine, room_id).await;
    assert_eq!(state.room.capacity, 3);
    assert_eq!(state.occupancies.len(), 1);
    assert_eq!(state.occupancies[0].id, left);
    assert_eq!(state.occupancies[0].status, OccupancyStatus::Left);
    let req = request_of(&engine, declined).await;
    assert_eq!(req.status, BookingStatus::Declined);
    assert!(req.note.is_some());
    assert_eq!(engine.requests_for(&resident, None, None).await.unwrap().len(), 2);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn approval_is_broadcast_to_room_listeners() {
    let engine = new_engine("notify_approval.wal");
    let (host, _, room_id) = host_with_room(&engine, 1).await;
    let resident = register(&engine, Role::Resident).await;
    let id = submit(&engine, &resident, room_id, dates::now() + Duration::days(5), 1).await;

    let mut rx = engine.notify.subscribe(room_id);
    let occupancy_id = engine.approve_request(&host, id).await.unwrap();
    match rx.recv().await.unwrap() {
        Event::RequestAccepted {
            id: got,
            occupancy_id: occ,
            ..
        } => {
            assert_eq!(got, id);
            assert_eq!(occ, occupancy_id);
        }
        other => panic!("unexpected event {other:?}"),
    }
}
