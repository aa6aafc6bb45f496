use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use stream_conductor::config::PersistenceConfig;
use stream_conductor::persistence::retry::{RetryPolicy, MAX_DELAY};
use stream_conductor::AppError;

fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        first: Duration::from_millis(1),
    }
}

#[test]
fn delay_doubles_and_is_capped() {
    let policy = RetryPolicy {
        attempts: 10,
        first: Duration::from_millis(100),
    };
    assert_eq!(policy.delay(0), Duration::from_millis(100));
    assert_eq!(policy.delay(1), Duration::from_millis(200));
    assert_eq!(policy.delay(3), Duration::from_millis(800));
    assert_eq!(policy.delay(20), MAX_DELAY);
}

#[test]
fn policy_follows_persistence_config() {
    let policy = RetryPolicy::from(&PersistenceConfig {
        retry_attempts: 4,
        retry_backoff_ms: 25,
    });
    assert_eq!(policy.attempts, 4);
    assert_eq!(policy.first, Duration::from_millis(25));
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result = fast_policy(3)
        .run("flaky", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::Db("database is locked".into()))
            } else {
                Ok(7)
            }
        })
        .await;
    assert_eq!(result.expect("eventual success"), 7);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_the_error() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<(), AppError> = fast_policy(2)
        .run("always busy", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Db("busy".into()))
        })
        .await;
    let err = result.expect_err("exhausted");
    assert!(err.to_string().contains("always busy"));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<(), AppError> = fast_policy(5)
        .run("lookup", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::NotFound("session x".into()))
        })
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_db_errors_are_not_retried() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<(), AppError> = fast_policy(5)
        .run("insert schedule", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::DbRejected("FOREIGN KEY constraint failed".into()))
        })
        .await;
    let err = result.expect_err("rejected");
    assert!(matches!(err, AppError::DbRejected(_)));
    assert!(err.to_string().contains("insert schedule"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
