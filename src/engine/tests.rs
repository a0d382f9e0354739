use super::*;
use crate::guard::{AllowAll, Role, RolePolicy};

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
const MON_0900: Ms = 1_710_752_400_000; // 2024-03-18 09:00 UTC

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("interviewd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: PathBuf) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new()), Arc::new(AllowAll), EngineConfig::default()).unwrap()
}

fn coord() -> Actor {
    Actor::new("coord@x.com", "Coord")
}

fn at(interviewer: &str, start: Ms) -> NewEvent {
    NewEvent::new(interviewer, start, start + H)
}

#[tokio::test]
async fn book_conflict_move_and_rebook() {
    let engine = open(test_wal_path("scenario.wal"));

    let first = engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();
    assert_eq!(first.version, 1);
    assert_eq!(first.status, EventStatus::Pending);
    assert_eq!(first.marked_by, "coord@x.com");

    // Same start, longer interview: still the 09:00 slot.
    let clash = NewEvent::new("a@x.com", MON_0900, MON_0900 + 90 * M);
    match engine.create_event(&coord(), clash.clone()).await {
        Err(EngineError::Conflict { existing, slot, .. }) => {
            assert_eq!(existing, first.id);
            assert_eq!(slot, "2024-03-18 09:00");
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let moved = engine
        .update_event(&coord(), first.id, EventPatch::times(MON_0900 + 30 * M, MON_0900 + 90 * M))
        .await
        .unwrap();
    assert_eq!(moved.version, 2);

    let second = engine.create_event(&coord(), clash).await.unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(engine.event_count(), 2);
    assert_eq!(engine.audit().len().await, 3);
}

#[tokio::test]
async fn slot_is_per_minute_and_per_interviewer() {
    let engine = open(test_wal_path("slot_granularity.wal"));
    engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();

    // 09:00:30 is the same wall-clock minute.
    let r = engine.create_event(&coord(), at("a@x.com", MON_0900 + 30_000)).await;
    assert!(matches!(r, Err(EngineError::Conflict { .. })));

    engine.create_event(&coord(), at("a@x.com", MON_0900 + M)).await.unwrap();
    engine.create_event(&coord(), at("b@x.com", MON_0900)).await.unwrap();
    // Interviewer keys are compared normalized.
    let r = engine.create_event(&coord(), at("  B@X.COM ", MON_0900)).await;
    assert!(matches!(r, Err(EngineError::Conflict { .. })));

    assert!(engine.has_conflict("A@x.com", MON_0900 + 59_000, None).await.unwrap());
    assert!(!engine.has_conflict("c@x.com", MON_0900, None).await.unwrap());
}

#[tokio::test]
async fn slot_day_follows_configured_timezone() {
    let config = EngineConfig {
        timezone: chrono_tz::America::New_York,
        ..Default::default()
    };
    let engine = Engine::new(
        test_wal_path("timezone.wal"),
        Arc::new(NotifyHub::new()),
        Arc::new(AllowAll),
        config,
    )
    .unwrap();
    // 2024-03-18 09:00 EDT
    let local_nine = MON_0900 + 4 * H;
    engine.create_event(&coord(), at("a@x.com", local_nine)).await.unwrap();
    match engine.create_event(&coord(), at("a@x.com", local_nine)).await {
        Err(EngineError::Conflict { slot, .. }) => assert_eq!(slot, "2024-03-18 09:00"),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_creates_for_one_slot_commit_once() {
    let engine = Arc::new(open(test_wal_path("concurrent_creates.wal")));

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut new = at("a@x.com", MON_0900);
            new.candidate_name = Some(format!("candidate {i}"));
            engine.create_event(&coord(), new).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(engine.event_count(), 1);
    assert_eq!(engine.audit().len().await, 1);
}

#[tokio::test]
async fn concurrent_moves_into_one_slot_commit_once() {
    let engine = Arc::new(open(test_wal_path("concurrent_moves.wal")));
    let mut ids = Vec::new();
    for (i, who) in ["b@x.com", "c@x.com", "d@x.com", "e@x.com"].iter().enumerate() {
        let ev = engine.create_event(&coord(), at(who, MON_0900 + i as Ms * H)).await.unwrap();
        ids.push(ev.id);
    }

    let mut handles = Vec::new();
    for id in ids {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let patch = EventPatch {
                interviewer: Some("a@x.com".into()),
                start: Some(MON_0900 + 2 * H),
                end: Some(MON_0900 + 3 * H),
                ..Default::default()
            };
            engine.update_event(&coord(), id, patch).await
        }));
    }
    let ok = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(engine.list_events(&EventFilter::for_interviewer("a@x.com")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn crossing_moves_between_two_interviewers_do_not_deadlock() {
    let engine = Arc::new(open(test_wal_path("crossing_moves.wal")));
    let mut handles = Vec::new();
    for i in 0..20 {
        let (from, to) = if i % 2 == 0 { ("a@x.com", "b@x.com") } else { ("b@x.com", "a@x.com") };
        let ev = engine.create_event(&coord(), at(from, MON_0900 + i * H)).await.unwrap();
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let patch = EventPatch {
                interviewer: Some(to.into()),
                ..Default::default()
            };
            engine.update_event(&coord(), ev.id, patch).await
        }));
    }
    let results = tokio::time::timeout(std::time::Duration::from_secs(10), futures::future::join_all(handles))
        .await
        .expect("moves deadlocked");
    assert!(results.into_iter().all(|r| r.unwrap().is_ok()));
    assert_eq!(engine.event_count(), 20);
}

#[tokio::test]
async fn status_change_is_stamped_and_audited_as_a_diff() {
    let engine = open(test_wal_path("status_diff.wal"));
    let ev = engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();

    let marker = Actor::new("lead@x.com", "Lead");
    let updated = engine
        .update_event(&marker, ev.id, EventPatch::status(EventStatus::Attended))
        .await
        .unwrap();
    assert_eq!(updated.status, EventStatus::Attended);
    assert_eq!(updated.marked_by, "lead@x.com");
    assert!(updated.marked_at >= ev.marked_at);
    assert_eq!(updated.version, 2);
    assert_eq!(updated.created_by, "coord@x.com");

    let entries = engine.audit().by_entity(ev.id).await;
    assert_eq!(entries.len(), 2);
    let update = entries.iter().find(|e| e.action == AuditAction::Update).unwrap();
    assert_eq!(update.actor_email, "lead@x.com");
    assert_eq!(update.entity_type, ENTITY_TYPE);
    let Changes::Updated(diff) = &update.changes else {
        panic!("expected a diff");
    };
    assert_eq!(diff["status"].from, FieldValue::Text("pending".into()));
    assert_eq!(diff["status"].to, FieldValue::Text("attended".into()));
    assert_eq!(diff["marked_by"].to, FieldValue::Text("lead@x.com".into()));
    assert!(!diff.contains_key("start_time"));

    let create = entries.iter().find(|e| e.action == AuditAction::Create).unwrap();
    let Changes::Created(snap) = &create.changes else {
        panic!("expected a snapshot");
    };
    assert_eq!(snap["interviewer"], FieldValue::Text("a@x.com".into()));
}

#[tokio::test]
async fn noop_update_commits_nothing() {
    let engine = open(test_wal_path("noop_update.wal"));
    let ev = engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();
    let mut rx = engine.notify.subscribe("a@x.com");

    let same = engine
        .update_event(&coord(), ev.id, EventPatch::status(EventStatus::Pending))
        .await
        .unwrap();
    assert_eq!(same, ev);
    assert_eq!(engine.audit().len().await, 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn text_fields_can_be_set_and_cleared() {
    let engine = open(test_wal_path("text_fields.wal"));
    let mut new = at("a@x.com", MON_0900);
    new.notes = Some("bring laptop".into());
    let ev = engine.create_event(&coord(), new).await.unwrap();

    let patch = EventPatch {
        notes: Some(None),
        position: Some(Some("SRE".into())),
        ..Default::default()
    };
    let updated = engine.update_event(&coord(), ev.id, patch).await.unwrap();
    assert_eq!(updated.notes, None);
    assert_eq!(updated.position.as_deref(), Some("SRE"));

    let long = EventPatch {
        notes: Some(Some("x".repeat(crate::limits::MAX_NOTES_LEN + 1))),
        ..Default::default()
    };
    let r = engine.update_event(&coord(), ev.id, long).await;
    assert!(matches!(r, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn delete_returns_final_state_once() {
    let engine = open(test_wal_path("delete_once.wal"));
    let ev = engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();
    let mut rx = engine.notify.subscribe("a@x.com");

    let gone = engine.delete_event(&coord(), ev.id).await.unwrap();
    assert_eq!(gone, ev);
    assert!(engine.get_event(ev.id).await.is_none());
    assert!(!engine.has_conflict("a@x.com", MON_0900, None).await.unwrap());

    let n = rx.try_recv().unwrap();
    assert_eq!(n.action, AuditAction::Delete);
    assert_eq!(n.event_id, ev.id);

    assert_eq!(engine.delete_event(&coord(), ev.id).await, Err(EngineError::NotFound(ev.id)));
    assert_eq!(engine.audit().len().await, 2);
    let deletes = engine
        .audit()
        .list(&AuditFilter {
            action: Some(AuditAction::Delete),
            ..Default::default()
        })
        .await;
    let Changes::Deleted(snap) = &deletes[0].changes else {
        panic!("expected final snapshot");
    };
    assert_eq!(snap["start_time"], FieldValue::Int(MON_0900));

    // The freed slot can be booked again.
    engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();
}

#[tokio::test]
async fn unknown_event_is_not_found() {
    let engine = open(test_wal_path("not_found.wal"));
    let id = Ulid::new();
    let r = engine.update_event(&coord(), id, EventPatch::status(EventStatus::Ghosted)).await;
    assert_eq!(r, Err(EngineError::NotFound(id)));
    assert!(engine.get_event(id).await.is_none());
    assert!(engine.audit().is_empty().await);
}

#[tokio::test]
async fn denied_writes_have_no_side_effects() {
    let policy = RolePolicy::new(Role::Viewer).grant("coord@x.com", Role::Coordinator, None);
    let engine = Engine::new(
        test_wal_path("forbidden.wal"),
        Arc::new(NotifyHub::new()),
        Arc::new(policy),
        EngineConfig::default(),
    )
    .unwrap();
    let mut rx = engine.notify.subscribe_all();
    let viewer = Actor::new("v@x.com", "Viewer");

    let r = engine.create_event(&viewer, at("a@x.com", MON_0900)).await;
    assert_eq!(
        r,
        Err(EngineError::Forbidden {
            actor: "v@x.com".into(),
            action: AuditAction::Create,
        })
    );
    assert_eq!(engine.event_count(), 0);

    let ev = engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();
    rx.try_recv().unwrap();

    let r = engine.update_event(&viewer, ev.id, EventPatch::status(EventStatus::Ghosted)).await;
    assert_eq!(r.unwrap_err().kind(), ErrorKind::Forbidden);
    // Coordinators may not delete.
    let r = engine.delete_event(&coord(), ev.id).await;
    assert_eq!(r.unwrap_err().kind(), ErrorKind::Forbidden);

    assert_eq!(engine.get_event(ev.id).await, Some(ev));
    assert_eq!(engine.audit().len().await, 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_write() {
    let engine = open(test_wal_path("validation.wal"));
    let inverted = NewEvent::new("a@x.com", MON_0900, MON_0900);
    assert!(matches!(
        engine.create_event(&coord(), inverted).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.create_event(&coord(), at("   ", MON_0900)).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.create_event(&coord(), at("a@x.com", 1_000)).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let ev = engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();
    let r = engine.update_event(&coord(), ev.id, EventPatch::start(MON_0900 + 2 * H)).await;
    assert!(matches!(r, Err(EngineError::Validation(_))));
    assert_eq!(engine.audit().len().await, 1);
    assert_eq!(engine.get_event(ev.id).await.unwrap().version, 1);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn storage_failure_leaves_no_trace() {
    // Every write to /dev/full fails with ENOSPC.
    let engine = Engine::new(
        PathBuf::from("/dev/full"),
        Arc::new(NotifyHub::new()),
        Arc::new(AllowAll),
        EngineConfig::default(),
    )
    .unwrap();
    let mut rx = engine.notify.subscribe_all();

    let err = engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
    assert!(err.is_retryable());

    assert_eq!(engine.event_count(), 0);
    assert!(engine.audit().is_empty().await);
    assert!(!engine.has_conflict("a@x.com", MON_0900, None).await.unwrap());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn moving_between_interviewers_rechecks_the_target() {
    let engine = open(test_wal_path("move.wal"));
    let ev = engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();
    engine.create_event(&coord(), at("b@x.com", MON_0900)).await.unwrap();
    let mut from_rx = engine.notify.subscribe("a@x.com");
    let mut to_rx = engine.notify.subscribe("c@x.com");

    let to_b = EventPatch {
        interviewer: Some("b@x.com".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_event(&coord(), ev.id, to_b).await,
        Err(EngineError::Conflict { .. })
    ));

    let to_c = EventPatch {
        interviewer: Some("C@x.com".into()),
        ..Default::default()
    };
    let moved = engine.update_event(&coord(), ev.id, to_c).await.unwrap();
    assert_eq!(moved.interviewer, "c@x.com");

    assert!(!engine.has_conflict("a@x.com", MON_0900, None).await.unwrap());
    assert!(engine.has_conflict("c@x.com", MON_0900, None).await.unwrap());
    assert!(!engine.has_conflict("c@x.com", MON_0900, Some(ev.id)).await.unwrap());
    assert_eq!(engine.interviewers().await, vec!["b@x.com", "c@x.com"]);
    assert_eq!(engine.get_event(ev.id).await, Some(moved));
    assert_eq!(from_rx.try_recv().unwrap().interviewer, "c@x.com");
    assert_eq!(to_rx.try_recv().unwrap().event_id, ev.id);
}

#[tokio::test]
async fn request_token_deduplicates_creates() {
    let engine = open(test_wal_path("token_dedup.wal"));
    let mut new = at("a@x.com", MON_0900);
    new.request_token = Some("tok-1".into());

    let first = engine.create_event(&coord(), new.clone()).await.unwrap();
    let again = engine.create_event(&coord(), new).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(engine.event_count(), 1);
    assert_eq!(engine.audit().len().await, 1);

    let mut other = at("a@x.com", MON_0900);
    other.request_token = Some("tok-2".into());
    assert!(matches!(
        engine.create_event(&coord(), other).await,
        Err(EngineError::Conflict { .. })
    ));
}

#[tokio::test]
async fn token_reused_for_another_interviewer_returns_the_original() {
    let engine = Arc::new(open(test_wal_path("token_cross_subject.wal")));
    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let interviewer = if i % 2 == 0 { "a@x.com" } else { "b@x.com" };
        let mut new = at(interviewer, MON_0900);
        new.request_token = Some("tok".into());
        handles.push(tokio::spawn(async move { engine.create_event(&coord(), new).await }));
    }
    let ids: Vec<Ulid> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().id)
        .collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(engine.event_count(), 1);
    assert_eq!(engine.audit().len().await, 1);
    assert!(engine.token_locks.is_empty());
}

#[tokio::test]
async fn pruned_tokens_no_longer_deduplicate() {
    let engine = open(test_wal_path("token_prune.wal"));
    let mut new = at("a@x.com", MON_0900);
    new.request_token = Some("tok".into());
    engine.create_event(&coord(), new.clone()).await.unwrap();

    let ttl = engine.config().token_ttl_ms;
    assert_eq!(engine.prune_request_tokens(super::conflict::now_ms()), 0);
    assert_eq!(engine.prune_request_tokens(super::conflict::now_ms() + ttl + 1), 1);

    // Same token, same slot: a fresh create that now conflicts.
    assert!(matches!(
        engine.create_event(&coord(), new).await,
        Err(EngineError::Conflict { .. })
    ));
}

#[tokio::test]
async fn list_events_filters_and_orders_by_start() {
    let engine = open(test_wal_path("list.wal"));
    let late = engine.create_event(&coord(), at("a@x.com", MON_0900 + 2 * H)).await.unwrap();
    let early = engine.create_event(&coord(), at("b@x.com", MON_0900)).await.unwrap();
    let mid = engine.create_event(&coord(), at("a@x.com", MON_0900 + H)).await.unwrap();
    engine
        .update_event(&coord(), mid.id, EventPatch::status(EventStatus::Ghosted))
        .await
        .unwrap();

    let all = engine.list_events(&EventFilter::default()).await.unwrap();
    assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![early.id, mid.id, late.id]);

    let a = engine.list_events(&EventFilter::for_interviewer("A@X.COM")).await.unwrap();
    assert_eq!(a.len(), 2);

    let window = EventFilter {
        start_from: Some(MON_0900),
        start_before: Some(MON_0900 + H),
        ..Default::default()
    };
    assert_eq!(engine.list_events(&window).await.unwrap(), vec![early]);

    let ghosted = EventFilter {
        status: Some(EventStatus::Ghosted),
        ..Default::default()
    };
    assert_eq!(engine.list_events(&ghosted).await.unwrap().len(), 1);

    let wide = EventFilter {
        start_from: Some(MON_0900),
        start_before: Some(MON_0900 + 400 * 24 * H),
        ..Default::default()
    };
    assert!(matches!(engine.list_events(&wide).await, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn extreme_query_window_is_rejected_not_overflowed() {
    let engine = open(test_wal_path("window_overflow.wal"));
    let widest = EventFilter {
        start_from: Some(-i64::MAX),
        start_before: Some(i64::MAX),
        ..Default::default()
    };
    assert!(matches!(engine.list_events(&widest).await, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn writes_after_a_torn_tail_survive_the_next_restart() {
    let path = test_wal_path("torn_restart.wal");
    let first = {
        let engine = open(path.clone());
        engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap()
    };
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7u8; 6]).unwrap();
    }
    let second = {
        let engine = open(path.clone());
        assert_eq!(engine.event_count(), 1);
        engine.create_event(&coord(), at("a@x.com", MON_0900 + H)).await.unwrap()
    };

    let engine = open(path);
    assert_eq!(engine.event_count(), 2);
    assert_eq!(engine.get_event(first.id).await, Some(first));
    assert_eq!(engine.get_event(second.id).await, Some(second));
    assert_eq!(engine.audit().len().await, 2);
}

#[tokio::test]
async fn failed_batch_is_never_replayed() {
    let path = test_wal_path("failed_batch.wal");
    let template = {
        let engine = open(path.clone());
        engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap()
    };
    let created = |start: Ms| {
        let event = InterviewEvent {
            id: Ulid::new(),
            start,
            end: start + H,
            ..template.clone()
        };
        Record::EventCreated {
            audit: AuditTrail::prepare(&coord(), Mutation::Created(&event), event.created_at),
            event,
            request_token: None,
        }
    };
    let batch = |record: Record| vec![(record, oneshot::channel().0)];

    let mut wal = Wal::open(&path).unwrap();
    wal.fail_next_sync();
    assert!(flush_batch(&mut wal, &batch(created(MON_0900 + H))).is_err());
    // The failure has cleared; the same slot is taken by a different event.
    flush_batch(&mut wal, &batch(created(MON_0900 + H))).unwrap();
    drop(wal);

    let engine = open(path);
    assert_eq!(engine.event_count(), 2);
    assert_eq!(engine.audit().len().await, 2);
    let at_ten = EventFilter {
        start_from: Some(MON_0900 + H),
        start_before: Some(MON_0900 + 2 * H),
        ..Default::default()
    };
    assert_eq!(engine.list_events(&at_ten).await.unwrap().len(), 1);
}

#[tokio::test]
async fn replay_restores_events_audit_and_tokens() {
    let path = test_wal_path("replay.wal");
    let (kept, moved) = {
        let engine = open(path.clone());
        let mut new = at("a@x.com", MON_0900);
        new.request_token = Some("tok".into());
        let kept = engine.create_event(&coord(), new).await.unwrap();
        let kept = engine
            .update_event(&coord(), kept.id, EventPatch::status(EventStatus::Attended))
            .await
            .unwrap();
        let doomed = engine.create_event(&coord(), at("a@x.com", MON_0900 + H)).await.unwrap();
        engine.delete_event(&coord(), doomed.id).await.unwrap();
        let moved = engine.create_event(&coord(), at("b@x.com", MON_0900)).await.unwrap();
        let patch = EventPatch {
            interviewer: Some("c@x.com".into()),
            ..Default::default()
        };
        let moved = engine.update_event(&coord(), moved.id, patch).await.unwrap();
        (kept, moved)
    };

    let engine = open(path);
    assert_eq!(engine.get_event(kept.id).await, Some(kept.clone()));
    assert_eq!(engine.get_event(moved.id).await, Some(moved));
    assert_eq!(engine.event_count(), 2);
    assert_eq!(engine.audit().len().await, 6);
    assert_eq!(engine.interviewers().await, vec!["a@x.com", "c@x.com"]);
    assert!(engine.has_conflict("a@x.com", MON_0900, None).await.unwrap());
    assert!(!engine.has_conflict("b@x.com", MON_0900, None).await.unwrap());

    let mut retry = at("a@x.com", MON_0900);
    retry.request_token = Some("tok".into());
    assert_eq!(engine.create_event(&coord(), retry).await.unwrap(), kept);
}

#[tokio::test]
async fn compaction_keeps_state_and_history() {
    let path = test_wal_path("compact.wal");
    let ids = {
        let engine = open(path.clone());
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut new = at("a@x.com", MON_0900 + i * H);
            new.request_token = Some(format!("tok-{i}"));
            ids.push(engine.create_event(&coord(), new).await.unwrap().id);
        }
        engine.delete_event(&coord(), ids.remove(0)).await.unwrap();
        engine
            .update_event(&coord(), ids[0], EventPatch::status(EventStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 7);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Appends after compaction land in the new file.
        engine.create_event(&coord(), at("b@x.com", MON_0900)).await.unwrap();
        ids
    };

    let engine = open(path);
    assert_eq!(engine.event_count(), 5);
    assert_eq!(engine.audit().len().await, 8);
    assert_eq!(engine.get_event(ids[0]).await.unwrap().status, EventStatus::Cancelled);
    assert_eq!(engine.get_event(ids[0]).await.unwrap().version, 2);

    let mut retry = at("a@x.com", MON_0900 + 2 * H);
    retry.request_token = Some("tok-2".into());
    assert_eq!(engine.create_event(&coord(), retry).await.unwrap().id, ids[1]);
}

#[tokio::test]
async fn audit_queries_filter_by_actor_action_and_time() {
    let engine = open(test_wal_path("audit_queries.wal"));
    let other = Actor::new("other@x.com", "Other");
    let a = engine.create_event(&coord(), at("a@x.com", MON_0900)).await.unwrap();
    engine.create_event(&other, at("b@x.com", MON_0900)).await.unwrap();
    engine
        .update_event(&other, a.id, EventPatch::status(EventStatus::Attended))
        .await
        .unwrap();

    assert_eq!(engine.audit().by_actor("OTHER@x.com").await.len(), 2);
    let updates = engine
        .audit()
        .list(&AuditFilter {
            action: Some(AuditAction::Update),
            ..Default::default()
        })
        .await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].entity_id, a.id);

    let recent = engine.audit().recent(2).await;
    assert_eq!(recent.len(), 2);
    assert!(recent[0].timestamp >= recent[1].timestamp);

    let future = engine
        .audit()
        .list(&AuditFilter {
            since: Some(super::conflict::now_ms() + H),
            ..Default::default()
        })
        .await;
    assert!(future.is_empty());

    let stats = engine.audit().stats_by_action().await;
    assert_eq!(stats["create_interview_event"], 2);
    assert_eq!(stats["update_interview_event"], 1);
}
