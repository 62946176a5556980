//! End-to-end tests against a real (local) DynamoDB.
//!
//! These need a dynamodb-local listening on `http://localhost:8000` (or
//! `VERLEASE_TEST_ENDPOINT`) and are `#[ignore]`d so the default test run
//! stays self-contained:
//!
//! ```sh
//! cargo test --test dynamodb -- --ignored
//! ```

mod util;

use std::time::Duration;
use util::*;
use verlease::{
    store::dynamodb::{DynamoDbControl, DynamoDbStore},
    LockError,
};

const LEASE_TABLE: &str = "test-verlease-locks";

#[tokio::test]
#[ignore = "requires a local dynamodb on localhost:8000"]
async fn acquire_contend_release() {
    let session = test_session(LEASE_TABLE, "it-host-a").await;
    let name = unique_name("acquire_contend_release");

    let mut lock = session.create_lock(&name, true);
    lock.acquire_with(10, Duration::from_secs(10)).await.unwrap();

    // A second contender cannot get it inside a zero deadline.
    let mut contender = session.create_lock(&name, true);
    let err = contender
        .acquire_with(10, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::NotGranted));

    lock.release().await.unwrap();

    // Released: immediately acquirable again.
    contender
        .acquire_with(10, Duration::from_secs(10))
        .await
        .unwrap();
    contender.release().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a local dynamodb on localhost:8000"]
async fn steals_expired_lease_from_crashed_holder() {
    let session = test_session(LEASE_TABLE, "it-host-a").await;
    let name = unique_name("steal");

    // "Crash": acquire with a 1s lease, never refresh or release.
    let mut casualty = session.create_lock(&name, false);
    casualty.acquire_with(1, Duration::from_secs(10)).await.unwrap();

    let other = test_session(LEASE_TABLE, "it-host-b").await;
    let mut lock = other.create_lock(&name, true);
    lock.acquire_with(5, Duration::from_secs(30)).await.unwrap();

    // The original holder is fenced out.
    let err = casualty.refresh().await.unwrap_err();
    assert!(matches!(err, LockError::Lost));

    lock.release().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a local dynamodb on localhost:8000"]
async fn handoff_between_sessions() {
    let sender = test_session(LEASE_TABLE, "it-host-a").await;
    let receiver = test_session(LEASE_TABLE, "it-host-b").await;
    let name = unique_name("handoff");

    let mut lock = sender.create_lock(&name, false);
    lock.acquire_with(20, Duration::from_secs(10)).await.unwrap();

    let serialized = lock.serialize().await.unwrap();
    let mut received = receiver.deserialize_lock(&serialized, false).await.unwrap();
    assert_eq!(received.name(), name);

    // The sender's stale copy lost; the recipient can release.
    assert!(matches!(lock.refresh().await.unwrap_err(), LockError::Lost));
    received.release().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a local dynamodb on localhost:8000"]
async fn connect_checks_table_exists() {
    let client = test_client().await;
    let err = DynamoDbStore::connect(client, "test-verlease-locks-not-exists")
        .await
        .expect_err("should check table exists");
    assert!(
        err.to_string().to_ascii_lowercase().contains("missing"),
        "{}",
        err
    );
}

#[tokio::test]
#[ignore = "requires a local dynamodb on localhost:8000"]
async fn control_plane_round_trip() {
    let client = test_client().await;
    let table = format!("test-verlease-ctl-{}", uuid::Uuid::new_v4().simple());
    let control = DynamoDbControl::new(client, &table);

    assert!(!control.exists().await.unwrap());
    control.create().await.unwrap();
    assert!(control.exists().await.unwrap());
    // Creating again is fine.
    control.create().await.unwrap();
    control.destroy().await.unwrap();
    assert!(!control.exists().await.unwrap());
}
