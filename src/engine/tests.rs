use super::*;
use crate::limits::MAX_ACTIVE_RESERVATIONS_PER_RESOURCE;
use crate::notify::Notice;
use std::path::PathBuf;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
/// A day far enough ahead that nothing here is overdue until a test says so.
const DAY0: Ms = 4_000_000_000_000 - 4_000_000_000_000 % (24 * H);

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("reserva_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> (Engine, PathBuf) {
    let path = test_wal_path(name);
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
    (engine, path)
}

fn requester(doc: &str) -> Requester {
    Requester {
        name: format!("Requester {doc}"),
        national_id: doc.to_string(),
        phone: None,
        email: None,
    }
}

fn asset_request(asset: Ulid, start: Ms, end: Ms, quantity: u32) -> SubmitRequest {
    SubmitRequest {
        resource: ResourceRef::Asset(asset),
        start: DAY0 + start,
        end: DAY0 + end,
        quantity,
        requester: requester("111"),
        purpose: "community fair".into(),
    }
}

fn space_request(space: Ulid, start: Ms, end: Ms) -> SubmitRequest {
    SubmitRequest {
        resource: ResourceRef::Space(space),
        start: DAY0 + start,
        end: DAY0 + end,
        quantity: 1,
        requester: requester("222"),
        purpose: String::new(),
    }
}

async fn asset(engine: &Engine, total_capacity: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .create_resource(id, Some("Chairs".into()), None, ResourceKind::CountableAsset { total_capacity })
        .await
        .unwrap();
    id
}

async fn space(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .create_resource(id, Some("Hall".into()), Some("Block A".into()), ResourceKind::ExclusiveSpace)
        .await
        .unwrap();
    id
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn create_and_query_resource() {
    let (engine, _) = new_engine("create_resource.wal");
    let id = space(&engine).await;

    let info = engine.get_resource_info(id).await.unwrap();
    assert_eq!(info.name, Some("Hall".into()));
    assert!(info.active);
    assert_eq!(info.kind, ResourceKind::ExclusiveSpace);

    let dup = engine
        .create_resource(id, None, None, ResourceKind::ExclusiveSpace)
        .await;
    assert_eq!(dup, Err(EngineError::AlreadyExists(id)));
}

#[tokio::test]
async fn dropped_create_still_lands_in_memory_and_log() {
    let (engine, path) = new_engine("dropped_create.wal");
    let id = Ulid::new();

    // A zero deadline drops the caller while the commit is in flight.
    let _ = tokio::time::timeout(
        std::time::Duration::ZERO,
        engine.create_resource(id, Some("Gym".into()), None, ResourceKind::ExclusiveSpace),
    )
    .await;

    let mut found = false;
    for _ in 0..1000 {
        if engine.get_resource_info(id).await.is_ok() {
            found = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    assert!(found);

    drop(engine);
    let reopened = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
    assert_eq!(reopened.get_resource_info(id).await.unwrap().name, Some("Gym".into()));
}

#[tokio::test]
async fn update_resource_keeps_kind() {
    let (engine, _) = new_engine("update_resource.wal");
    let hall = space(&engine).await;
    let chairs = asset(&engine, 10).await;

    engine
        .update_resource(chairs, Some("Folding chairs".into()), None, Some(25))
        .await
        .unwrap();
    let info = engine.get_resource_info(chairs).await.unwrap();
    assert_eq!(info.kind, ResourceKind::CountableAsset { total_capacity: 25 });
    assert_eq!(engine.global_available(chairs).await.unwrap(), 25);

    let err = engine.update_resource(hall, None, None, Some(3)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidQuantity { quantity: 3, .. }));
}

// ── Asset admission ──────────────────────────────────────

#[tokio::test]
async fn capacity_ten_seven_then_five_then_three() {
    let (engine, _) = new_engine("capacity_scenario.wal");
    let chairs = asset(&engine, 10).await;

    engine.submit(asset_request(chairs, 9 * H, 12 * H, 7)).await.unwrap();

    let err = engine
        .submit(asset_request(chairs, 10 * H, 11 * H, 5))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientStock {
            resource_id: chairs,
            span: Some(Span::new(DAY0 + 10 * H, DAY0 + 11 * H)),
            requested: 5,
            available: 3,
        }
    );

    let admitted = engine.submit(asset_request(chairs, 10 * H, 11 * H, 3)).await.unwrap();
    assert_eq!(admitted.reservation.state, ReservationState::Pending);
    assert!(admitted.advisories.is_empty());

    assert_eq!(engine.global_available(chairs).await.unwrap(), 0);
    assert_eq!(
        engine.window_available(chairs, DAY0 + 9 * H, DAY0 + 10 * H).await.unwrap(),
        3
    );
    assert_eq!(
        engine.window_available(chairs, DAY0 + 13 * H, DAY0 + 14 * H).await.unwrap(),
        10
    );
}

#[tokio::test]
async fn touching_asset_windows_each_get_full_stock() {
    let (engine, _) = new_engine("disjoint_windows.wal");
    let chairs = asset(&engine, 4).await;

    engine.submit(asset_request(chairs, 0, H, 4)).await.unwrap();
    // Touching at the boundary is not an overlap.
    engine.submit(asset_request(chairs, H, 2 * H, 4)).await.unwrap();

    assert_eq!(engine.global_available(chairs).await.unwrap(), 0);
    assert_eq!(engine.window_available(chairs, DAY0, DAY0 + H).await.unwrap(), 0);
}

#[tokio::test]
async fn cancelled_reservations_release_stock() {
    let (engine, _) = new_engine("release_stock.wal");
    let chairs = asset(&engine, 5).await;

    let r = engine.submit(asset_request(chairs, 0, H, 5)).await.unwrap();
    assert!(engine.submit(asset_request(chairs, 0, H, 1)).await.is_err());

    engine.cancel(r.reservation.id).await.unwrap();
    engine.submit(asset_request(chairs, 0, H, 5)).await.unwrap();
}

#[tokio::test]
async fn approve_asset_rechecks_stock() {
    let (engine, _) = new_engine("approve_asset.wal");
    let chairs = asset(&engine, 6).await;

    // The long request fits alone; two later ones fill each end of its window.
    let long = engine.submit(asset_request(chairs, 0, 3 * H, 3)).await.unwrap();
    let morning = engine.submit(asset_request(chairs, 0, H, 3)).await.unwrap();
    engine.submit(asset_request(chairs, 2 * H, 3 * H, 3)).await.unwrap();

    let err = engine.approve(long.reservation.id).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientStock {
            resource_id: chairs,
            span: Some(Span::new(DAY0, DAY0 + 3 * H)),
            requested: 3,
            available: 0,
        }
    );
    assert_eq!(
        engine.get_reservation(long.reservation.id).await.unwrap().state,
        ReservationState::Pending
    );

    engine.approve(morning.reservation.id).await.unwrap();
    engine.cancel(morning.reservation.id).await.unwrap();
    let approved = engine.approve(long.reservation.id).await.unwrap();
    assert_eq!(approved.state, ReservationState::Approved);
}

#[tokio::test]
async fn capacity_cannot_shrink_below_active_load() {
    let (engine, _) = new_engine("shrink_capacity.wal");
    let chairs = asset(&engine, 10).await;

    engine.submit(asset_request(chairs, 0, 2 * H, 5)).await.unwrap();
    let late = engine.submit(asset_request(chairs, H, 3 * H, 3)).await.unwrap();

    let err = engine.update_resource(chairs, None, None, Some(7)).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientStock {
            resource_id: chairs,
            span: None,
            requested: 8,
            available: 7,
        }
    );
    let info = engine.get_resource_info(chairs).await.unwrap();
    assert_eq!(info.kind, ResourceKind::CountableAsset { total_capacity: 10 });

    // Down to the peak is fine; freeing stock allows going lower.
    engine.update_resource(chairs, None, None, Some(8)).await.unwrap();
    engine.cancel(late.reservation.id).await.unwrap();
    engine.update_resource(chairs, None, None, Some(5)).await.unwrap();
    assert_eq!(engine.global_available(chairs).await.unwrap(), 0);
}

#[tokio::test]
async fn terminal_history_does_not_count_toward_reservation_cap() {
    let (engine, _) = new_engine("terminal_history.wal");
    let chairs = asset(&engine, 10).await;
    let hall = space(&engine).await;

    let fill = |rs: &mut ResourceState, resource: ResourceRef, state: ReservationState| {
        for i in 0..MAX_ACTIVE_RESERVATIONS_PER_RESOURCE as i64 {
            rs.insert_reservation(Reservation {
                id: Ulid::new(),
                resource,
                span: Span::new(DAY0 + 10 * H + i * M, DAY0 + 10 * H + (i + 1) * M),
                quantity: 1,
                requester_id: "111".into(),
                purpose: String::new(),
                state,
                created_at: DAY0,
                updated_at: DAY0,
            });
        }
    };
    {
        let rs = engine.get_resource(&chairs).unwrap();
        let mut guard = rs.write().await;
        fill(&mut *guard, ResourceRef::Asset(chairs), ReservationState::Cancelled);
    }
    {
        let rs = engine.get_resource(&hall).unwrap();
        let mut guard = rs.write().await;
        fill(&mut *guard, ResourceRef::Space(hall), ReservationState::Pending);
    }

    assert_eq!(engine.global_available(chairs).await.unwrap(), 10);
    engine.submit(asset_request(chairs, 0, H, 1)).await.unwrap();

    let err = engine.submit(space_request(hall, 0, H)).await.unwrap_err();
    assert_eq!(err, EngineError::LimitExceeded("too many reservations on resource"));
}

#[tokio::test]
async fn zero_and_oversized_quantities_are_rejected() {
    let (engine, _) = new_engine("bad_quantity.wal");
    let chairs = asset(&engine, 5).await;
    let hall = space(&engine).await;

    let err = engine.submit(asset_request(chairs, 0, H, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidQuantity { quantity: 0, .. }));

    let err = engine.submit(asset_request(chairs, 0, H, 6)).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientStock { available: 5, .. }));

    let mut req = space_request(hall, 0, H);
    req.quantity = 2;
    let err = engine.submit(req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidQuantity { quantity: 2, .. }));
}

#[tokio::test]
async fn inverted_interval_is_rejected() {
    let (engine, _) = new_engine("inverted_interval.wal");
    let chairs = asset(&engine, 5).await;

    let err = engine.submit(asset_request(chairs, 2 * H, H, 1)).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::InvalidInterval {
            start: DAY0 + 2 * H,
            end: DAY0 + H
        }
    );
    let err = engine.submit(asset_request(chairs, H, H, 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInterval { .. }));
}

#[tokio::test]
async fn kind_mismatch_is_not_found() {
    let (engine, _) = new_engine("kind_mismatch.wal");
    let chairs = asset(&engine, 5).await;
    let hall = space(&engine).await;

    let err = engine.submit(space_request(chairs, 0, H)).await.unwrap_err();
    assert_eq!(err, EngineError::ResourceNotFound(chairs));
    let err = engine.submit(asset_request(hall, 0, H, 1)).await.unwrap_err();
    assert_eq!(err, EngineError::ResourceNotFound(hall));

    assert_eq!(
        engine.global_available(hall).await,
        Err(EngineError::ResourceNotFound(hall))
    );
    assert_eq!(
        engine.conflicts(chairs, DAY0, DAY0 + H, None).await,
        Err(EngineError::ResourceNotFound(chairs))
    );
    let ghost = Ulid::new();
    assert_eq!(
        engine.submit(asset_request(ghost, 0, H, 1)).await.unwrap_err(),
        EngineError::ResourceNotFound(ghost)
    );
}

#[tokio::test]
async fn inactive_resource_refuses_new_work() {
    let (engine, _) = new_engine("inactive.wal");
    let hall = space(&engine).await;

    let pending = engine.submit(space_request(hall, 0, H)).await.unwrap();
    engine.set_resource_active(hall, false).await.unwrap();
    assert!(!engine.get_resource_info(hall).await.unwrap().active);

    assert_eq!(
        engine.submit(space_request(hall, 2 * H, 3 * H)).await.unwrap_err(),
        EngineError::ResourceInactive(hall)
    );
    assert_eq!(
        engine.approve(pending.reservation.id).await.unwrap_err(),
        EngineError::ResourceInactive(hall)
    );
    // Closing existing reservations is still allowed.
    engine.cancel(pending.reservation.id).await.unwrap();
    assert!(engine
        .free_windows(hall, DAY0, DAY0 + 4 * H, 1)
        .await
        .unwrap()
        .is_empty());

    engine.set_resource_active(hall, true).await.unwrap();
    engine.submit(space_request(hall, 2 * H, 3 * H)).await.unwrap();
}

// ── Space admission ──────────────────────────────────────

#[tokio::test]
async fn space_approval_blocks_on_overlap() {
    let (engine, _) = new_engine("space_conflict.wal");
    let hall = space(&engine).await;

    let r1 = engine.submit(space_request(hall, 9 * H, 10 * H)).await.unwrap();
    engine.approve(r1.reservation.id).await.unwrap();

    let r2 = engine
        .submit(space_request(hall, 9 * H + 30 * M, 10 * H + 30 * M))
        .await
        .unwrap();
    assert_eq!(r2.advisories.len(), 1);
    assert_eq!(r2.advisories[0].id, r1.reservation.id);
    assert_eq!(r2.advisories[0].state, ReservationState::Approved);

    let err = engine.approve(r2.reservation.id).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::ConflictDetected {
            resource_id: hall,
            span: Span::new(DAY0 + 9 * H + 30 * M, DAY0 + 10 * H + 30 * M),
            conflicting: vec![r1.reservation.id],
        }
    );
    let r2_now = engine.get_reservation(r2.reservation.id).await.unwrap();
    assert_eq!(r2_now.state, ReservationState::Pending);
}

#[tokio::test]
async fn pending_competitor_blocks_approval_until_resolved() {
    let (engine, _) = new_engine("competing_pending.wal");
    let hall = space(&engine).await;

    let a = engine.submit(space_request(hall, 0, 2 * H)).await.unwrap();
    let b = engine.submit(space_request(hall, H, 3 * H)).await.unwrap();
    assert_eq!(b.advisories.len(), 1);

    // A pending competitor blocks approval too.
    assert!(matches!(
        engine.approve(a.reservation.id).await,
        Err(EngineError::ConflictDetected { .. })
    ));
    engine.reject(b.reservation.id).await.unwrap();
    engine.approve(a.reservation.id).await.unwrap();

    let conflicts = engine.conflicts(hall, DAY0 + H, DAY0 + 2 * H, None).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, a.reservation.id);
    assert!(engine
        .conflicts(hall, DAY0 + H, DAY0 + 2 * H, Some(a.reservation.id))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn back_to_back_space_bookings_do_not_conflict() {
    let (engine, _) = new_engine("back_to_back.wal");
    let hall = space(&engine).await;

    let a = engine.submit(space_request(hall, 10 * H, 11 * H)).await.unwrap();
    let b = engine.submit(space_request(hall, 11 * H, 12 * H)).await.unwrap();
    assert!(b.advisories.is_empty());
    engine.approve(a.reservation.id).await.unwrap();
    engine.approve(b.reservation.id).await.unwrap();
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn cancel_twice_is_already_terminal() {
    let (engine, _) = new_engine("cancel_twice.wal");
    let hall = space(&engine).await;
    let r = engine.submit(space_request(hall, 0, H)).await.unwrap();
    let id = r.reservation.id;

    let cancelled = engine.cancel(id).await.unwrap();
    assert_eq!(cancelled.state, ReservationState::Cancelled);

    assert_eq!(
        engine.cancel(id).await.unwrap_err(),
        EngineError::AlreadyTerminal {
            id,
            state: ReservationState::Cancelled
        }
    );
    assert_eq!(
        engine.get_reservation(id).await.unwrap().state,
        ReservationState::Cancelled
    );
}

#[tokio::test]
async fn reject_after_approve_is_invalid() {
    let (engine, _) = new_engine("reject_after_approve.wal");
    let hall = space(&engine).await;
    let r = engine.submit(space_request(hall, 0, H)).await.unwrap();
    let id = r.reservation.id;

    engine.approve(id).await.unwrap();
    assert_eq!(
        engine.reject(id).await.unwrap_err(),
        EngineError::InvalidTransition {
            id,
            from: ReservationState::Approved,
            to: ReservationState::Rejected
        }
    );
    assert!(matches!(
        engine.approve(id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    engine.cancel(id).await.unwrap();
    assert!(matches!(
        engine.edit(id, DAY0, DAY0 + H, 1).await,
        Err(EngineError::AlreadyTerminal { .. })
    ));
}

#[tokio::test]
async fn unknown_reservation_is_not_found() {
    let (engine, _) = new_engine("unknown_reservation.wal");
    let id = Ulid::new();
    assert_eq!(engine.approve(id).await, Err(EngineError::ReservationNotFound(id)));
    assert_eq!(engine.get_reservation(id).await, Err(EngineError::ReservationNotFound(id)));
}

// ── Edit ─────────────────────────────────────────────────

#[tokio::test]
async fn edit_excludes_own_footprint() {
    let (engine, _) = new_engine("edit_own_footprint.wal");
    let chairs = asset(&engine, 10).await;

    let r = engine.submit(asset_request(chairs, 0, 2 * H, 10)).await.unwrap();
    let id = r.reservation.id;

    // Same footprint, then shrink, then grow back: all fit because the old
    // quantity is not counted against itself.
    engine.edit(id, DAY0, DAY0 + 2 * H, 10).await.unwrap();
    engine.edit(id, DAY0, DAY0 + H, 4).await.unwrap();
    assert_eq!(engine.global_available(chairs).await.unwrap(), 6);
    let grown = engine.edit(id, DAY0, DAY0 + 2 * H, 10).await.unwrap();
    assert_eq!(grown.reservation.quantity, 10);

    let other = engine.submit(asset_request(chairs, 5 * H, 6 * H, 3)).await.unwrap();
    let err = engine
        .edit(other.reservation.id, DAY0 + H, DAY0 + 6 * H, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientStock { available: 0, .. }));
    assert_eq!(
        engine.get_reservation(other.reservation.id).await.unwrap().start,
        DAY0 + 5 * H
    );
}

#[tokio::test]
async fn edit_approved_space_must_stay_clear() {
    let (engine, _) = new_engine("edit_space.wal");
    let hall = space(&engine).await;

    let a = engine.submit(space_request(hall, 0, H)).await.unwrap();
    let b = engine.submit(space_request(hall, 2 * H, 3 * H)).await.unwrap();
    engine.approve(a.reservation.id).await.unwrap();

    let err = engine
        .edit(a.reservation.id, DAY0 + H, DAY0 + 2 * H + 30 * M, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConflictDetected { ref conflicting, .. } if conflicting == &vec![b.reservation.id]));

    // Pending edits only get advisories.
    let moved = engine
        .edit(b.reservation.id, DAY0 + 30 * M, DAY0 + 2 * H, 1)
        .await
        .unwrap();
    assert_eq!(moved.advisories.len(), 1);
    assert_eq!(moved.reservation.start, DAY0 + 30 * M);

    let listed = engine.list_by_resource(hall, StateFilter::Active).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.windows(2).all(|w| w[0].start <= w[1].start));
}

// ── Auto-expiry ──────────────────────────────────────────

#[tokio::test]
async fn overdue_pending_is_cancelled_on_listing() {
    let (engine, _) = new_engine("expiry_listing.wal");
    let hall = space(&engine).await;

    let early = engine.submit(space_request(hall, H, 2 * H)).await.unwrap();
    let late = engine.submit(space_request(hall, 5 * H, 6 * H)).await.unwrap();
    let approved = engine.submit(space_request(hall, 0, 30 * M)).await.unwrap();
    engine.approve(approved.reservation.id).await.unwrap();

    let now = DAY0 + 3 * H;
    let pending = engine.list_pending_at(now).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, late.reservation.id);

    assert_eq!(
        engine.get_reservation(early.reservation.id).await.unwrap().state,
        ReservationState::Cancelled
    );
    // Approved reservations are never auto-expired.
    assert_eq!(
        engine.get_reservation(approved.reservation.id).await.unwrap().state,
        ReservationState::Approved
    );

    // Starting exactly now is not overdue.
    let at_start = engine.list_pending_at(DAY0 + 5 * H).await.unwrap();
    assert_eq!(at_start.len(), 1);
}

#[tokio::test]
async fn approval_expires_stale_competitors_first() {
    let (engine, _) = new_engine("expiry_on_approve.wal");
    let hall = space(&engine).await;
    let mut notices = engine.notify.subscribe(hall);

    let stale = engine.submit(space_request(hall, 0, H)).await.unwrap();
    let target = engine.submit(space_request(hall, 30 * M, 2 * H)).await.unwrap();

    let now = DAY0 + 20 * M;
    let approved = engine.approve_at(target.reservation.id, now).await.unwrap();
    assert_eq!(approved.state, ReservationState::Approved);
    assert_eq!(
        engine.get_reservation(stale.reservation.id).await.unwrap().state,
        ReservationState::Cancelled
    );

    let mut auto = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let Notice::AutoCancelled { reservation_id, .. } = notice {
            auto.push(reservation_id);
        }
    }
    assert_eq!(auto, vec![stale.reservation.id]);
}

#[tokio::test]
async fn approving_an_overdue_request_expires_it() {
    let (engine, _) = new_engine("approve_overdue.wal");
    let hall = space(&engine).await;
    let r = engine.submit(space_request(hall, 0, H)).await.unwrap();

    let err = engine.approve_at(r.reservation.id, DAY0 + 10 * M).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::AlreadyTerminal {
            id: r.reservation.id,
            state: ReservationState::Cancelled
        }
    );
}

#[tokio::test]
async fn listing_without_pending_filter_does_not_expire() {
    let (engine, _) = new_engine("expiry_filter.wal");
    let hall = space(&engine).await;
    let r = engine.submit(space_request(hall, 0, H)).await.unwrap();

    let approved_only = engine
        .list_by_resource_at(hall, StateFilter::Only(ReservationState::Approved), DAY0 + 2 * H)
        .await
        .unwrap();
    assert!(approved_only.is_empty());
    assert_eq!(
        engine.get_reservation(r.reservation.id).await.unwrap().state,
        ReservationState::Pending
    );

    let all = engine
        .list_by_resource_at(hall, StateFilter::All, DAY0 + 2 * H)
        .await
        .unwrap();
    assert_eq!(all[0].state, ReservationState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_expiry_fires_exactly_once() {
    let (engine, _) = new_engine("expiry_concurrent.wal");
    let engine = Arc::new(engine);
    let hall = space(&engine).await;
    let chairs = asset(&engine, 50).await;

    let mut overdue = Vec::new();
    for i in 0..5 {
        overdue.push(engine.submit(space_request(hall, i * H, i * H + 30 * M)).await.unwrap().reservation.id);
        overdue.push(engine.submit(asset_request(chairs, i * H, (i + 1) * H, 2)).await.unwrap().reservation.id);
    }

    let mut notices = engine.notify.subscribe_all();
    let now = DAY0 + 24 * H;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move { eng.list_pending_at(now).await }));
    }
    for h in handles {
        assert!(h.await.unwrap().unwrap().is_empty());
    }

    let mut auto_cancelled = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let Notice::AutoCancelled { reservation_id, .. } = notice {
            auto_cancelled.push(reservation_id);
        }
    }
    auto_cancelled.sort();
    overdue.sort();
    assert_eq!(auto_cancelled, overdue);
    assert_eq!(engine.global_available(chairs).await.unwrap(), 50);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_never_oversell() {
    let path = test_wal_path("no_oversell.wal");
    let config = EngineConfig {
        max_admission_retries: 64,
    };
    let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new()), config).unwrap());
    let chairs = asset(&engine, 10).await;

    let mut handles = Vec::new();
    for i in 0..30 {
        let eng = engine.clone();
        // Staggered, all overlapping [2h, 3h).
        let start = 2 * H - (i % 3) * M;
        handles.push(tokio::spawn(async move {
            eng.submit(asset_request(chairs, start, 3 * H + (i % 4) * M, 1)).await
        }));
    }

    let mut admitted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert!(matches!(e, EngineError::InsufficientStock { .. }), "{e}"),
        }
    }
    assert_eq!(admitted, 10);
    assert_eq!(engine.global_available(chairs).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_approve_and_cancel_never_double_book() {
    let (engine, _) = new_engine("space_race.wal");
    let engine = Arc::new(engine);
    let hall = space(&engine).await;

    for round in 0..10 {
        let base = round * 4 * H;
        let a = engine.submit(space_request(hall, base, base + 2 * H)).await.unwrap().reservation.id;
        let b = engine.submit(space_request(hall, base + H, base + 3 * H)).await.unwrap().reservation.id;

        let (ea, eb) = (engine.clone(), engine.clone());
        let (approved, cancelled) = tokio::join!(
            tokio::spawn(async move { ea.approve(a).await }),
            tokio::spawn(async move { eb.cancel(b).await })
        );
        cancelled.unwrap().unwrap();
        match approved.unwrap() {
            Ok(info) => assert_eq!(info.state, ReservationState::Approved),
            Err(e) => assert!(matches!(e, EngineError::ConflictDetected { .. }), "{e}"),
        }
    }

    let approved: Vec<Span> = engine
        .list_by_resource(hall, StateFilter::Only(ReservationState::Approved))
        .await
        .unwrap()
        .iter()
        .map(|r| Span::new(r.start, r.end))
        .collect();
    for (i, x) in approved.iter().enumerate() {
        for y in &approved[i + 1..] {
            assert!(!x.overlaps(y));
        }
    }
}

#[tokio::test]
async fn parked_reader_delays_but_does_not_invalidate_a_plan() {
    let (engine, _) = new_engine("parked_reader.wal");
    let chairs = asset(&engine, 10).await;
    let rs = engine.get_resource(&chairs).unwrap();
    let calls = std::sync::atomic::AtomicU32::new(0);

    let blocker = rs.clone().read_owned().await;
    let admission = engine.admit(chairs, |state| {
        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok((
            Event::ResourceStatusChanged {
                id: state.id,
                active: true,
            },
            state.revision,
        ))
    });
    let release = async {
        tokio::task::yield_now().await;
        drop(blocker);
    };
    let (planned_at, ()) = tokio::join!(admission, release);

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(rs.read().await.revision, planned_at.unwrap() + 1);
}

// ── Requesters ───────────────────────────────────────────

#[tokio::test]
async fn requesters_are_upserted_by_identity() {
    let (engine, _) = new_engine("requesters.wal");
    let hall = space(&engine).await;

    let mut req = space_request(hall, 0, H);
    req.requester = Requester {
        name: "Ana".into(),
        national_id: " AB-123 ".into(),
        phone: Some("555-0100".into()),
        email: None,
    };
    let first = engine.submit(req.clone()).await.unwrap();
    assert_eq!(first.reservation.requester_id, "ab-123");

    req.start = DAY0 + 2 * H;
    req.end = DAY0 + 3 * H;
    req.requester = Requester {
        name: "Ana Maria".into(),
        national_id: "ab-123".into(),
        phone: None,
        email: Some("ana@example.org".into()),
    };
    engine.submit(req).await.unwrap();

    let stored = engine.get_requester("ab-123").unwrap();
    assert_eq!(stored.name, "Ana Maria");
    assert_eq!(stored.phone, Some("555-0100".into()));
    assert_eq!(stored.email, Some("ana@example.org".into()));
    assert_eq!(engine.requesters.len(), 1);
}

// ── Free windows ─────────────────────────────────────────

#[tokio::test]
async fn free_windows_for_space_and_asset() {
    let (engine, _) = new_engine("free_windows.wal");
    let hall = space(&engine).await;
    let chairs = asset(&engine, 10).await;

    engine.submit(space_request(hall, 2 * H, 3 * H)).await.unwrap();
    let cancelled = engine.submit(space_request(hall, 5 * H, 6 * H)).await.unwrap();
    engine.cancel(cancelled.reservation.id).await.unwrap();

    let windows = engine.free_windows(hall, DAY0, DAY0 + 8 * H, 1).await.unwrap();
    assert_eq!(
        windows,
        vec![
            Span::new(DAY0, DAY0 + 2 * H),
            Span::new(DAY0 + 3 * H, DAY0 + 8 * H)
        ]
    );

    engine.submit(asset_request(chairs, 0, 4 * H, 6)).await.unwrap();
    engine.submit(asset_request(chairs, 2 * H, 6 * H, 3)).await.unwrap();
    // Load: 6 on [0,2h), 9 on [2h,4h), 3 on [4h,6h).
    let windows = engine.free_windows(chairs, DAY0, DAY0 + 8 * H, 4).await.unwrap();
    assert_eq!(
        windows,
        vec![
            Span::new(DAY0, DAY0 + 2 * H),
            Span::new(DAY0 + 4 * H, DAY0 + 8 * H)
        ]
    );
    assert!(engine.free_windows(chairs, DAY0, DAY0 + H, 11).await.unwrap().is_empty());
}

// ── Notices ──────────────────────────────────────────────

#[tokio::test]
async fn lifecycle_emits_notices() {
    let (engine, _) = new_engine("notices.wal");
    let hall = space(&engine).await;
    let mut rx = engine.notify.subscribe(hall);

    let r = engine.submit(space_request(hall, 0, H)).await.unwrap();
    let id = r.reservation.id;
    engine.edit(id, DAY0, DAY0 + 2 * H, 1).await.unwrap();
    engine.approve(id).await.unwrap();
    engine.cancel(id).await.unwrap();

    assert!(matches!(rx.recv().await.unwrap(), Notice::Created { reservation_id, .. } if reservation_id == id));
    assert!(matches!(rx.recv().await.unwrap(), Notice::Edited { span, .. } if span == Span::new(DAY0, DAY0 + 2 * H)));
    assert!(matches!(rx.recv().await.unwrap(), Notice::Approved { .. }));
    assert!(matches!(rx.recv().await.unwrap(), Notice::Cancelled { .. }));
    assert!(rx.try_recv().is_err());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_reservations_and_requesters() {
    let (engine, path) = new_engine("replay.wal");
    let hall = space(&engine).await;
    let chairs = asset(&engine, 10).await;

    let a = engine.submit(space_request(hall, 0, H)).await.unwrap();
    engine.approve(a.reservation.id).await.unwrap();
    let b = engine.submit(asset_request(chairs, 0, H, 7)).await.unwrap();
    engine.edit(b.reservation.id, DAY0, DAY0 + 2 * H, 8).await.unwrap();
    let c = engine.submit(asset_request(chairs, 3 * H, 4 * H, 1)).await.unwrap();
    engine.reject(c.reservation.id).await.unwrap();
    engine.set_resource_active(hall, false).await.unwrap();

    let engine2 = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
    assert_eq!(
        engine2.get_reservation(a.reservation.id).await.unwrap().state,
        ReservationState::Approved
    );
    let b2 = engine2.get_reservation(b.reservation.id).await.unwrap();
    assert_eq!((b2.end, b2.quantity), (DAY0 + 2 * H, 8));
    assert_eq!(
        engine2.get_reservation(c.reservation.id).await.unwrap().state,
        ReservationState::Rejected
    );
    assert_eq!(engine2.global_available(chairs).await.unwrap(), 2);
    assert!(!engine2.get_resource_info(hall).await.unwrap().active);
    assert!(engine2.get_requester("111").is_some());
    assert!(engine2.get_requester("222").is_some());
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let (engine, path) = new_engine("group_commit_batch.wal");
    let engine = Arc::new(engine);
    let chairs = asset(&engine, 100).await;

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.submit(asset_request(chairs, i * H, (i + 1) * H, 5)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let engine2 = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
    let listed = engine2.list_by_resource(chairs, StateFilter::All).await.unwrap();
    assert_eq!(listed.len(), n as usize);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let (engine, path) = new_engine("compaction.wal");
    let hall = space(&engine).await;
    let chairs = asset(&engine, 10).await;

    for i in 0..10 {
        let r = engine.submit(asset_request(chairs, i * H, (i + 1) * H, 5)).await.unwrap();
        engine.cancel(r.reservation.id).await.unwrap();
    }
    let kept = engine.submit(space_request(hall, 0, H)).await.unwrap();
    engine.approve(kept.reservation.id).await.unwrap();
    engine.set_resource_active(chairs, false).await.unwrap();

    let before = std::fs::metadata(&path).unwrap().len();
    assert!(engine.wal_appends_since_compact().await > 20);
    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    let after = std::fs::metadata(&path).unwrap().len();
    assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

    // Appends after compaction land in the new file.
    let late = engine.submit(space_request(hall, 2 * H, 3 * H)).await.unwrap();

    let engine2 = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
    assert_eq!(
        engine2.get_reservation(kept.reservation.id).await.unwrap().state,
        ReservationState::Approved
    );
    assert_eq!(
        engine2.get_reservation(late.reservation.id).await.unwrap().state,
        ReservationState::Pending
    );
    assert_eq!(
        engine2.list_by_resource(chairs, StateFilter::All).await.unwrap().len(),
        10
    );
    assert!(!engine2.get_resource_info(chairs).await.unwrap().active);
    assert_eq!(engine2.get_requester("111").unwrap().name, "Requester 111");
}

#[tokio::test]
async fn compact_if_needed_respects_threshold() {
    let (engine, _) = new_engine("compact_threshold.wal");
    let chairs = asset(&engine, 10).await;
    engine.submit(asset_request(chairs, 0, H, 1)).await.unwrap();

    assert_eq!(engine.wal_appends_since_compact().await, 2);
    assert!(!engine.compact_if_needed(3).await.unwrap());
    assert!(engine.compact_if_needed(2).await.unwrap());
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}
