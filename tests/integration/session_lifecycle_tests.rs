//! Integration tests for the session registry state machine.
//!
//! Validates:
//! - start and stop are idempotent and never spawn a second process
//! - concurrent starts for one session converge on a single handle
//! - a failed start leaves the session `Failed` until reset
//! - a status write that fails mid-transition leaves the session resettable
//! - delete stops the encoder and removes schedules in one step
//! - every committed transition is broadcast in order

use std::sync::Arc;

use stream_conductor::models::schedule::ScheduleAction;
use stream_conductor::models::session::{DesiredState, Destination, SessionStatus};
use stream_conductor::AppError;

use super::test_helpers::{daily, new_session, Harness};

/// Make the database refuse any write of `status`.
async fn refuse_status(h: &Harness, status: &str) {
    sqlx::query(&format!(
        "CREATE TRIGGER refuse_{status} BEFORE UPDATE OF status ON sessions
         WHEN NEW.status = '{status}'
         BEGIN SELECT RAISE(ABORT, 'status write refused'); END"
    ))
    .execute(h.db.as_ref())
    .await
    .expect("create trigger");
}

async fn allow_status(h: &Harness, status: &str) {
    sqlx::query(&format!("DROP TRIGGER refuse_{status}"))
        .execute(h.db.as_ref())
        .await
        .expect("drop trigger");
}

#[tokio::test]
async fn create_rejects_invalid_destination() {
    let h = Harness::new().await;
    let mut request = new_session("bad");
    request.destination = Destination::Custom {
        url: "http://example.com/live".into(),
    };

    let err = h
        .registry
        .create_session(request)
        .await
        .expect_err("invalid destination");
    assert!(matches!(err, AppError::Config(_)));
    assert!(h.registry.list_sessions().await.expect("list").is_empty());
}

#[tokio::test]
async fn create_rejects_empty_name() {
    let h = Harness::new().await;
    let err = h
        .registry
        .create_session(new_session("  "))
        .await
        .expect_err("empty name");
    assert!(matches!(err, AppError::Config(_)));
}

#[tokio::test]
async fn start_runs_encoder_and_persists_running() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("main"))
        .await
        .expect("create");

    let handle = h.registry.request_start(&session.id).await.expect("start");
    assert_eq!(handle.instance, h.unit(&session.id));
    assert!(h.control.is_running(&handle.instance));

    let stored = h.registry.get_session(&session.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Running);
    assert_eq!(stored.desired_state, DesiredState::Running);
    assert_eq!(stored.process_ref.as_deref(), Some(handle.instance.as_str()));
}

#[tokio::test]
async fn repeated_start_returns_same_handle_without_respawn() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("main"))
        .await
        .expect("create");

    let first = h.registry.request_start(&session.id).await.expect("start");
    let second = h.registry.request_start(&session.id).await.expect("start again");

    assert_eq!(first, second);
    assert_eq!(h.control.start_count(), 1);
    assert_eq!(h.control.running_count(), 1);
}

#[tokio::test]
async fn concurrent_starts_spawn_one_process() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("race"))
        .await
        .expect("create");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&h.registry);
        let id = session.id.clone();
        tasks.push(tokio::spawn(async move { registry.request_start(&id).await }));
    }

    let mut instances = Vec::new();
    for task in tasks {
        let handle = task.await.expect("join").expect("start");
        instances.push(handle.instance);
    }

    instances.dedup();
    assert_eq!(instances.len(), 1, "all callers see the same instance");
    assert_eq!(h.control.start_count(), 1);
    assert_eq!(h.control.running_count(), 1);
}

#[tokio::test]
async fn interleaved_start_stop_never_leaves_two_processes() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("flip"))
        .await
        .expect("create");

    let mut tasks = Vec::new();
    for i in 0..10 {
        let registry = Arc::clone(&h.registry);
        let id = session.id.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                registry.request_start(&id).await.map(|_| ())
            } else {
                registry.request_stop(&id).await.map(|_| ())
            }
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("operation");
    }

    assert!(h.control.running_count() <= 1);
    let stored = h.registry.get_session(&session.id).await.expect("get");
    assert_eq!(
        stored.status == SessionStatus::Running,
        h.control.is_running(&h.unit(&session.id)),
        "persisted status matches process reality"
    );
}

#[tokio::test]
async fn stop_on_idle_is_a_no_op() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("idle"))
        .await
        .expect("create");

    let first = h.registry.request_stop(&session.id).await.expect("stop");
    let second = h.registry.request_stop(&session.id).await.expect("stop again");

    assert_eq!(first.status, SessionStatus::Idle);
    assert_eq!(second.status, SessionStatus::Idle);
    assert_eq!(h.control.start_count(), 0);
    assert_eq!(h.control.stop_count(), 0);
}

#[tokio::test]
async fn repeated_stop_after_running_is_idempotent() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("main"))
        .await
        .expect("create");
    h.registry.request_start(&session.id).await.expect("start");

    let stopped = h.registry.request_stop(&session.id).await.expect("stop");
    assert_eq!(stopped.status, SessionStatus::Idle);
    assert_eq!(stopped.desired_state, DesiredState::Stopped);
    assert!(stopped.process_ref.is_none());
    let stops = h.control.stop_count();

    let again = h.registry.request_stop(&session.id).await.expect("stop again");
    assert_eq!(again.status, SessionStatus::Idle);
    assert_eq!(h.control.stop_count(), stops);
    assert_eq!(h.control.running_count(), 0);
}

#[tokio::test]
async fn failed_start_marks_session_failed_until_reset() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("broken"))
        .await
        .expect("create");
    h.control.fail_starts(true);

    let err = h
        .registry
        .request_start(&session.id)
        .await
        .expect_err("start fails");
    assert!(matches!(err, AppError::ProcessStart(_)));
    let stored = h.registry.get_session(&session.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Failed);

    let err = h
        .registry
        .request_start(&session.id)
        .await
        .expect_err("failed sessions need reset");
    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert_eq!(h.control.start_attempts(), 1, "no automatic retry");

    h.control.fail_starts(false);
    let reset = h.registry.reset(&session.id).await.expect("reset");
    assert_eq!(reset.status, SessionStatus::Idle);
    h.registry.request_start(&session.id).await.expect("start after reset");
}

#[tokio::test]
async fn reset_requires_failed_status() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("ok"))
        .await
        .expect("create");
    let err = h.registry.reset(&session.id).await.expect_err("not failed");
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn hung_control_call_times_out_as_start_failure() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("slow"))
        .await
        .expect("create");
    h.control.hang(true);

    let err = h
        .registry
        .request_start(&session.id)
        .await
        .expect_err("timeout");
    assert!(matches!(err, AppError::ProcessStart(_)));

    h.control.hang(false);
    let stored = h.registry.get_session(&session.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Failed);
}

#[tokio::test]
async fn unrecorded_running_state_leaves_session_resettable() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("unrecorded"))
        .await
        .expect("create");
    refuse_status(&h, "running").await;

    let err = h
        .registry
        .request_start(&session.id)
        .await
        .expect_err("running state not recorded");
    assert!(matches!(err, AppError::DbRejected(_)), "got {err}");
    allow_status(&h, "running").await;

    assert!(!h.control.is_running(&h.unit(&session.id)));
    let stored = h.registry.get_session(&session.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Failed);

    let reset = h.registry.reset(&session.id).await.expect("reset");
    assert_eq!(reset.status, SessionStatus::Idle);
    h.registry.request_start(&session.id).await.expect("start again");
    assert_eq!(h.control.running_count(), 1);
}

#[tokio::test]
async fn unrecorded_idle_state_leaves_session_resettable() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("unrecorded-stop"))
        .await
        .expect("create");
    h.registry.request_start(&session.id).await.expect("start");
    refuse_status(&h, "idle").await;

    let err = h
        .registry
        .request_stop(&session.id)
        .await
        .expect_err("idle state not recorded");
    assert!(matches!(err, AppError::DbRejected(_)), "got {err}");
    allow_status(&h, "idle").await;

    assert_eq!(h.control.running_count(), 0);
    let stored = h.registry.get_session(&session.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Failed);
    let reset = h.registry.reset(&session.id).await.expect("reset");
    assert_eq!(reset.status, SessionStatus::Idle);
}

#[tokio::test]
async fn unknown_ids_leave_no_lock_entries() {
    let h = Harness::new().await;
    for n in 0..5 {
        let id = format!("ghost-{n}");
        assert!(h.registry.request_start(&id).await.is_err());
        assert!(h.registry.request_stop(&id).await.is_err());
        assert!(h.registry.reset(&id).await.is_err());
    }
    assert_eq!(h.registry.tracked_locks().await, 0);

    let session = h
        .registry
        .create_session(new_session("tracked"))
        .await
        .expect("create");
    h.registry.request_start(&session.id).await.expect("start");
    assert_eq!(h.registry.tracked_locks().await, 1);

    h.registry.delete(&session.id).await.expect("delete");
    assert_eq!(h.registry.tracked_locks().await, 0);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let h = Harness::new().await;
    for err in [
        h.registry.request_start("ghost").await.map(|_| ()),
        h.registry.request_stop("ghost").await.map(|_| ()),
        h.registry.delete("ghost").await.map(|_| ()),
    ] {
        assert!(matches!(err, Err(AppError::NotFound(_))));
    }
}

#[tokio::test]
async fn delete_stops_process_and_removes_schedules() {
    let h = Harness::new().await;
    let session = h
        .registry
        .create_session(new_session("doomed"))
        .await
        .expect("create");
    h.engine
        .create(&session.id, daily(6, 0, "UTC", ScheduleAction::Start))
        .await
        .expect("schedule 1");
    h.engine
        .create(&session.id, daily(22, 0, "UTC", ScheduleAction::Stop))
        .await
        .expect("schedule 2");
    let handle = h.registry.request_start(&session.id).await.expect("start");

    let removed = h.registry.delete(&session.id).await.expect("delete");

    assert_eq!(removed, 2);
    assert!(!h.control.is_running(&handle.instance));
    assert!(h.engine.list().await.expect("list").is_empty());
    assert!(matches!(
        h.registry.get_session(&session.id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn transitions_are_broadcast_in_order() {
    let h = Harness::new().await;
    let mut rx = h.registry.notifier().subscribe();
    let session = h
        .registry
        .create_session(new_session("watched"))
        .await
        .expect("create");

    h.registry.request_start(&session.id).await.expect("start");
    h.registry.request_stop(&session.id).await.expect("stop");

    let mut states = Vec::new();
    while let Ok(change) = rx.try_recv() {
        assert_eq!(change.session_id, session.id);
        states.push(change.new_state);
    }
    assert_eq!(
        states,
        vec![
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Stopping,
            SessionStatus::Idle,
        ]
    );
}
