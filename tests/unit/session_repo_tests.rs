use std::sync::Arc;

use stream_conductor::models::session::{
    DesiredState, Destination, NewSession, Session, SessionStatus, StreamSource,
};
use stream_conductor::persistence::{db, session_repo::SessionRepo};
use stream_conductor::AppError;

fn sample_session(name: &str) -> Session {
    Session::new(NewSession {
        name: name.into(),
        owner: "owner-1".into(),
        source: StreamSource {
            path: "/srv/media/loop.mp4".into(),
            looping: true,
        },
        destination: Destination::Custom {
            url: "rtmp://ingest.example.com/live/key".into(),
        },
    })
}

async fn repo() -> SessionRepo {
    let pool = db::connect_memory().await.expect("db connect");
    SessionRepo::new(Arc::new(pool))
}

#[tokio::test]
async fn in_memory_connect_creates_tables() {
    let pool = db::connect_memory()
        .await
        .expect("in-memory connect should succeed");

    for table in ["sessions", "schedules"] {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let row: (i64,) = sqlx::query_as(&query)
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("table '{table}' should be queryable: {e}"));
        assert_eq!(row.0, 0, "table '{table}' should start empty");
    }
}

#[tokio::test]
async fn create_and_fetch_round_trips_json_columns() {
    let repo = repo().await;
    let session = sample_session("evening");
    repo.create(&session).await.expect("create");

    let fetched = repo
        .get_by_id(&session.id)
        .await
        .expect("fetch")
        .expect("present");
    assert_eq!(fetched.source, session.source);
    assert_eq!(fetched.destination, session.destination);
    assert_eq!(fetched.status, SessionStatus::Idle);
}

#[tokio::test]
async fn missing_session_is_none() {
    let repo = repo().await;
    assert!(repo.get_by_id("nope").await.expect("query").is_none());
}

#[tokio::test]
async fn update_status_follows_transition_table() {
    let repo = repo().await;
    let session = sample_session("a");
    repo.create(&session).await.expect("create");

    let starting = repo
        .update_status(&session.id, SessionStatus::Starting, None)
        .await
        .expect("idle -> starting");
    assert_eq!(starting.status, SessionStatus::Starting);

    let running = repo
        .update_status(&session.id, SessionStatus::Running, Some("unit-a"))
        .await
        .expect("starting -> running");
    assert_eq!(running.process_ref.as_deref(), Some("unit-a"));

    let err = repo
        .update_status(&session.id, SessionStatus::Starting, None)
        .await
        .expect_err("running -> starting is invalid");
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let stored = repo
        .get_by_id(&session.id)
        .await
        .expect("fetch")
        .expect("present");
    assert_eq!(stored.status, SessionStatus::Running);
    assert_eq!(stored.process_ref.as_deref(), Some("unit-a"));
}

#[tokio::test]
async fn update_status_on_missing_session_is_not_found() {
    let repo = repo().await;
    let err = repo
        .update_status("ghost", SessionStatus::Starting, None)
        .await
        .expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn list_by_status_filters() {
    let repo = repo().await;
    let a = sample_session("a");
    let b = sample_session("b");
    repo.create(&a).await.expect("create a");
    repo.create(&b).await.expect("create b");
    repo.update_status(&b.id, SessionStatus::Starting, None)
        .await
        .expect("b starting");

    let idle = repo
        .list_by_status(SessionStatus::Idle)
        .await
        .expect("list idle");
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].id, a.id);
    assert_eq!(repo.list_all().await.expect("list all").len(), 2);
}

#[tokio::test]
async fn desired_state_is_recorded() {
    let repo = repo().await;
    let session = sample_session("a");
    repo.create(&session).await.expect("create");

    let updated = repo
        .set_desired_state(&session.id, DesiredState::Running)
        .await
        .expect("set desired");
    assert_eq!(updated.desired_state, DesiredState::Running);
    assert_eq!(updated.status, SessionStatus::Idle);

    let err = repo
        .set_desired_state("ghost", DesiredState::Running)
        .await
        .expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn delete_missing_session_is_not_found() {
    let repo = repo().await;
    let err = repo
        .delete_with_schedules("ghost")
        .await
        .expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)));
}
