use chrono::Utc;
use stream_conductor::models::session::SessionStatus;
use stream_conductor::notify::Notifier;

#[tokio::test]
async fn subscribers_receive_changes_in_order() {
    let notifier = Notifier::new(8);
    let mut rx = notifier.subscribe();
    let now = Utc::now();

    notifier.emit("s1", SessionStatus::Starting, now);
    notifier.emit("s1", SessionStatus::Running, now);

    let first = rx.recv().await.expect("first");
    let second = rx.recv().await.expect("second");
    assert_eq!(first.session_id, "s1");
    assert_eq!(first.new_state, SessionStatus::Starting);
    assert_eq!(second.new_state, SessionStatus::Running);
}

#[test]
fn emit_without_subscribers_is_silent() {
    let notifier = Notifier::default();
    notifier.emit("s1", SessionStatus::Failed, Utc::now());
}

#[test]
fn state_change_serializes_snake_case_state() {
    let notifier = Notifier::new(1);
    let mut rx = notifier.subscribe();
    notifier.emit("s9", SessionStatus::Stopping, Utc::now());

    let change = rx.try_recv().expect("queued");
    let json = serde_json::to_value(&change).expect("serialize");
    assert_eq!(json["session_id"], "s9");
    assert_eq!(json["new_state"], "stopping");
}
