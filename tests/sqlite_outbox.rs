//! Outbox delivery against the SQLite store.

#![cfg(feature = "sqlite")]

use chrono::Utc;
use loadgate::infrastructure::mocks::{MockClock, RecordingBroker};
use loadgate::{
    Clock, NewOutboxMessage, OutboxProcessor, OutboxStatus, OutboxStore, ProcessorConfig,
    PublishError, SqliteOutboxStore,
};
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn order_created(id: &str) -> NewOutboxMessage {
    let payload = serde_json::json!({ "order_id": id });
    NewOutboxMessage::json("order", id, "OrderCreated", &payload).unwrap()
}

#[tokio::test]
async fn test_message_committed_with_business_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");

    {
        let mut conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE orders (id TEXT PRIMARY KEY, total INTEGER NOT NULL)")
            .unwrap();
        SqliteOutboxStore::migrate(&conn).unwrap();

        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO orders (id, total) VALUES (?1, ?2)", params!["42", 10])
            .unwrap();
        SqliteOutboxStore::insert_in_tx(&tx, order_created("42"), Utc::now()).unwrap();
        tx.commit().unwrap();

        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO orders (id, total) VALUES (?1, ?2)", params!["43", 5])
            .unwrap();
        SqliteOutboxStore::insert_in_tx(&tx, order_created("43"), Utc::now()).unwrap();
        tx.rollback().unwrap();
    }

    let store = Arc::new(SqliteOutboxStore::open(&path).unwrap());
    let broker = Arc::new(RecordingBroker::new());
    let processor =
        OutboxProcessor::new(store.clone(), broker.clone(), Arc::new(MockClock::default()));

    let report = processor.run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].queue, "events.order_created");
    assert_eq!(published[0].payload, br#"{"order_id":"42"}"#.to_vec());

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts[&OutboxStatus::Completed], 1);
    assert_eq!(counts[&OutboxStatus::Pending], 0);
}

#[tokio::test]
async fn test_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.db");

    let id = {
        let store = SqliteOutboxStore::open(&path).unwrap();
        store.insert(order_created("7")).await.unwrap()
    };

    let store = SqliteOutboxStore::open(&path).unwrap();
    let message = store.get(id).await.unwrap().unwrap();
    assert_eq!(message.aggregate_id, "7");
    assert_eq!(message.status, OutboxStatus::Pending);
}

#[tokio::test]
async fn test_retries_until_terminal() {
    let clock = MockClock::default();
    let store = Arc::new(SqliteOutboxStore::in_memory().unwrap());
    let broker = Arc::new(RecordingBroker::new());
    broker.fail_next(3, PublishError::Unreachable("connection refused".into()));

    let id = store.insert(order_created("9")).await.unwrap();
    let processor = OutboxProcessor::new(store.clone(), broker.clone(), Arc::new(clock.clone()));

    let mut exhausted = 0;
    for _ in 0..4 {
        exhausted += processor.run_once().await.unwrap().exhausted;
    }
    assert_eq!(exhausted, 1);

    let message = store.get(id).await.unwrap().unwrap();
    assert_eq!(message.status, OutboxStatus::Failed);
    assert_eq!(message.attempts, 3);
    assert!(message.error_message.unwrap().contains("connection refused"));
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_expired_claim_reclaimed_by_another_worker() {
    let clock = MockClock::default();
    let store = SqliteOutboxStore::in_memory().unwrap();
    let id = store.insert(order_created("5")).await.unwrap();
    let visibility = ProcessorConfig::default().visibility_timeout;

    // First worker claims and crashes
    let crashed = Uuid::new_v4();
    assert_eq!(store.claim_batch(10, crashed, clock.now(), visibility).await.unwrap().len(), 1);
    assert!(store
        .claim_batch(10, Uuid::new_v4(), clock.now(), visibility)
        .await
        .unwrap()
        .is_empty());

    clock.advance(visibility + Duration::from_secs(1));
    let survivor = Uuid::new_v4();
    let reclaimed = store.claim_batch(10, survivor, clock.now(), visibility).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempts, 2);

    assert!(!store.mark_completed(id, crashed, clock.now()).await.unwrap());
    assert!(store.mark_completed(id, survivor, clock.now()).await.unwrap());
}
