//! Integration tests for the crash-detecting status monitor.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use stream_conductor::models::session::SessionStatus;
use stream_conductor::orchestrator::monitor::{poll_running, spawn_status_monitor};

use super::test_helpers::{new_session, Harness};

#[tokio::test]
async fn crashed_encoder_marks_session_failed() {
    let h = Harness::new().await;
    let healthy = h
        .registry
        .create_session(new_session("healthy"))
        .await
        .expect("create");
    let doomed = h
        .registry
        .create_session(new_session("doomed"))
        .await
        .expect("create");
    h.registry.request_start(&healthy.id).await.expect("start");
    h.registry.request_start(&doomed.id).await.expect("start");
    let mut rx = h.registry.notifier().subscribe();

    h.control.crash(&h.unit(&doomed.id));
    let failed = poll_running(&h.registry).await;

    assert_eq!(failed, 1);
    let change = rx.try_recv().expect("failure broadcast");
    assert_eq!(change.session_id, doomed.id);
    assert_eq!(change.new_state, SessionStatus::Failed);

    let still_running = h.registry.get_session(&healthy.id).await.expect("get");
    assert_eq!(still_running.status, SessionStatus::Running);
    assert_eq!(h.control.start_count(), 2, "monitor never restarts");
}

#[tokio::test]
async fn monitor_task_polls_until_cancelled() {
    let h = Harness::new().await;
    let s = h
        .registry
        .create_session(new_session("watched"))
        .await
        .expect("create");
    h.registry.request_start(&s.id).await.expect("start");

    let cancel = CancellationToken::new();
    let task = spawn_status_monitor(
        std::sync::Arc::clone(&h.registry),
        Duration::from_millis(50),
        cancel.clone(),
    );
    h.control.crash(&h.unit(&s.id));

    let mut failed = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if h.registry.get_session(&s.id).await.expect("get").status == SessionStatus::Failed {
            failed = true;
            break;
        }
    }
    assert!(failed, "monitor should detect the crash");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("monitor stops")
        .expect("join");
}
