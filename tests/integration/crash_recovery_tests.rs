//! Integration tests for startup reconciliation.
//!
//! Each test builds state with one harness, then reconciles through a
//! second harness over the same database and process table, the way a
//! restarted daemon would see it.

use std::sync::Arc;

use stream_conductor::models::session::{DesiredState, SessionStatus};
use stream_conductor::orchestrator::reconciler::{reconcile, ReconcileReport};

use super::test_helpers::{new_session, Harness};

fn restarted(h: &Harness) -> Harness {
    Harness::over(Arc::clone(&h.db), Arc::clone(&h.control))
}

#[tokio::test]
async fn missing_process_is_restarted_exactly_once() {
    let h = Harness::new().await;
    let s = h
        .registry
        .create_session(new_session("crashed"))
        .await
        .expect("create");
    h.registry.request_start(&s.id).await.expect("start");
    h.control.crash(&h.unit(&s.id));

    let after = restarted(&h);
    let report = reconcile(&after.registry).await.expect("reconcile");

    assert_eq!(
        report,
        ReconcileReport {
            restarted: 1,
            ..ReconcileReport::default()
        }
    );
    assert_eq!(h.control.start_count(), 2);
    let stored = after.registry.get_session(&s.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Running);
    assert!(h.control.is_running(&h.unit(&s.id)));
}

#[tokio::test]
async fn failed_restart_is_not_retried() {
    let h = Harness::new().await;
    let s = h
        .registry
        .create_session(new_session("flaky"))
        .await
        .expect("create");
    h.registry.request_start(&s.id).await.expect("start");
    h.control.crash(&h.unit(&s.id));
    h.control.fail_starts(true);

    let after = restarted(&h);
    let report = reconcile(&after.registry).await.expect("reconcile");
    assert_eq!(report.failed, 1);
    assert_eq!(report.restarted, 0);
    assert_eq!(h.control.start_attempts(), 2);

    let stored = after.registry.get_session(&s.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Failed);

    // A later pass leaves the failed session alone.
    let again = reconcile(&after.registry).await.expect("reconcile again");
    assert_eq!(again.failed, 1);
    assert_eq!(h.control.start_attempts(), 2);
}

#[tokio::test]
async fn live_process_is_adopted_without_restart() {
    let h = Harness::new().await;
    let s = h
        .registry
        .create_session(new_session("survivor"))
        .await
        .expect("create");
    // Crash happened after the start call but before `Running` was stored.
    h.sessions
        .set_desired_state(&s.id, DesiredState::Running)
        .await
        .expect("desired");
    h.sessions
        .update_status(&s.id, SessionStatus::Starting, None)
        .await
        .expect("starting");
    h.control.set_running(&h.unit(&s.id));

    let after = restarted(&h);
    let report = reconcile(&after.registry).await.expect("reconcile");

    assert_eq!(report.adopted, 1);
    assert_eq!(h.control.start_attempts(), 0);
    let stored = after.registry.get_session(&s.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Running);
    assert_eq!(stored.process_ref, Some(h.unit(&s.id)));

    // The adopted handle is tracked, so a start request is a no-op.
    let handle = after.registry.request_start(&s.id).await.expect("start");
    assert_eq!(handle.instance, h.unit(&s.id));
    assert_eq!(h.control.start_attempts(), 0);
}

#[tokio::test]
async fn unwanted_process_is_stopped() {
    let h = Harness::new().await;
    let s = h
        .registry
        .create_session(new_session("stale"))
        .await
        .expect("create");
    h.control.set_running(&h.unit(&s.id));

    let after = restarted(&h);
    let report = reconcile(&after.registry).await.expect("reconcile");

    assert_eq!(report.stopped, 1);
    assert!(!h.control.is_running(&h.unit(&s.id)));
    let stored = after.registry.get_session(&s.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Idle);
}

#[tokio::test]
async fn orphan_units_are_stopped_and_foreign_units_ignored() {
    let h = Harness::new().await;
    let orphan = h.unit("6f1c2a8e-3b4d-4e5f-9a0b-1c2d3e4f5a6b");
    h.control.set_running(&orphan);
    h.control.set_running("nginx");

    let report = reconcile(&h.registry).await.expect("reconcile");

    assert_eq!(report, ReconcileReport::default());
    assert!(!h.control.is_running(&orphan));
    assert!(h.control.is_running("nginx"));
}

#[tokio::test]
async fn units_sharing_the_prefix_without_a_session_id_survive() {
    let h = Harness::new().await;
    let neighbour = h.unit("backup");
    h.control.set_running(&neighbour);

    reconcile(&h.registry).await.expect("reconcile");

    assert!(h.control.is_running(&neighbour));
    assert_eq!(h.control.stop_count(), 0);
}

#[tokio::test]
async fn interrupted_stop_converges_to_idle() {
    let h = Harness::new().await;
    let s = h
        .registry
        .create_session(new_session("halfway"))
        .await
        .expect("create");
    h.registry.request_start(&s.id).await.expect("start");
    // Stop was in flight: status stored, process already gone.
    h.sessions
        .set_desired_state(&s.id, DesiredState::Stopped)
        .await
        .expect("desired");
    h.sessions
        .update_status(&s.id, SessionStatus::Stopping, None)
        .await
        .expect("stopping");
    h.control.crash(&h.unit(&s.id));

    let after = restarted(&h);
    reconcile(&after.registry).await.expect("reconcile");

    let stored = after.registry.get_session(&s.id).await.expect("get");
    assert_eq!(stored.status, SessionStatus::Idle);
    assert_eq!(h.control.start_count(), 1);
}

#[tokio::test]
async fn listing_failure_falls_back_to_per_session_status() {
    let h = Harness::new().await;
    let s = h
        .registry
        .create_session(new_session("fallback"))
        .await
        .expect("create");
    h.registry.request_start(&s.id).await.expect("start");
    h.control.fail_list(true);

    let after = restarted(&h);
    let report = reconcile(&after.registry).await.expect("reconcile");

    assert_eq!(report.adopted, 1);
    assert_eq!(h.control.start_count(), 1);
}
