use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use super::fakes::{post, Connection, FakeApi, FlakyStore};
use crate::core::clock::ManualClock;
use crate::core::retry::Limited;
use crate::core::stream::{classify, store_post, StreamClassifier};
use crate::models::{Classification, TrackedAccount, STREAM_CONTENT, STREAM_EXTRA};
use crate::providers::{ApiError, StreamEvent};
use crate::roster::Roster;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-10T08:00:00Z").unwrap().with_timezone(&Utc)
}

fn roster() -> Roster {
    Roster::new(vec![
        TrackedAccount { id: Some(1), handle: Some("alice".to_string()) },
        TrackedAccount { id: Some(2), handle: Some("bob".to_string()) },
    ])
}

fn reshare(id: u64, author: u64) -> serde_json::Value {
    let mut p = post(id, author);
    p["retweeted_status"] = post(id - 1, 99);
    p
}

#[test]
fn test_classification_matrix() {
    let roster = roster();
    assert_eq!(classify(&post(10, 1), &roster), Classification::TrackedContent);
    assert_eq!(classify(&reshare(11, 1), &roster), Classification::Incidental);
    assert_eq!(classify(&post(12, 99), &roster), Classification::Incidental);
    assert_eq!(classify(&reshare(13, 99), &roster), Classification::Incidental);
}

#[test]
fn test_null_reshare_field_is_original() {
    let mut p = post(10, 2);
    p["retweeted_status"] = serde_json::Value::Null;
    assert_eq!(classify(&p, &roster()), Classification::TrackedContent);
}

#[test]
fn test_post_without_author_is_incidental() {
    let p = json!({"id_str": "10", "text": "orphan"});
    assert_eq!(classify(&p, &roster()), Classification::Incidental);
}

#[tokio::test]
async fn test_store_post_routes_and_stamps() {
    let store = FlakyStore::new();
    let clock = ManualClock::new(t0());
    let roster = roster();

    let mut stamped = post(20, 99);
    stamped["timestamp_ms"] = json!("1000");

    assert_eq!(
        store_post(&store, &roster, &clock, post(10, 1)).await.unwrap(),
        Classification::TrackedContent
    );
    assert_eq!(
        store_post(&store, &roster, &clock, stamped).await.unwrap(),
        Classification::Incidental
    );

    let content = store.inner.documents(STREAM_CONTENT).await;
    assert_eq!(content.len(), 1);
    assert_eq!(content[0]["timestamp_ms"], json!(t0().timestamp_millis().to_string()));

    let extra = store.inner.documents(STREAM_EXTRA).await;
    assert_eq!(extra.len(), 1);
    assert_eq!(extra[0]["timestamp_ms"], json!("1000"));
}

#[tokio::test]
async fn test_reconnects_after_refusal_and_disconnect() {
    let api = Arc::new(
        FakeApi::new()
            .with_connection(Connection::Refused(420))
            .with_connection(Connection::Events(vec![
                Ok(StreamEvent::Post(post(10, 1))),
                Err(ApiError::Disconnected("stall warning".to_string())),
            ]))
            .with_connection(Connection::Events(vec![
                Ok(StreamEvent::Post(post(11, 99))),
                Ok(StreamEvent::Notice(json!({"limit": {"track": 3}}))),
                Ok(StreamEvent::Post(reshare(12, 2))),
            ])),
    );
    let store = Arc::new(FlakyStore::new());
    let clock = ManualClock::new(t0());
    let classifier = Arc::new(
        StreamClassifier::new(api.clone(), store.clone(), Arc::new(clock)).with_reconnect(Box::new(Limited {
            retries: 10,
            delay: Duration::ZERO,
        })),
    );

    let cancel = CancellationToken::new();
    let handle = {
        let classifier = Arc::clone(&classifier);
        let cancel = cancel.clone();
        tokio::spawn(async move { classifier.run(Arc::new(roster()), &cancel).await })
    };

    timeout(Duration::from_secs(5), async {
        loop {
            let stored = store.inner.count(STREAM_CONTENT).await + store.inner.count(STREAM_EXTRA).await;
            if stored == 3 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("posts were not stored in time");

    cancel.cancel();
    let stats = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    // refused, dropped, ended, then left idle on the last connection
    assert_eq!(*api.stream_opens.lock().unwrap(), 4);
    assert_eq!(stats.connections, 3);
    assert_eq!(stats.tracked, 1);
    assert_eq!(stats.incidental, 2);
    assert_eq!(stats.write_errors, 0);

    let content = store.inner.documents(STREAM_CONTENT).await;
    assert_eq!(content[0]["id_str"], json!("10"));
}

#[tokio::test]
async fn test_gives_up_when_policy_is_exhausted() {
    let api = Arc::new(
        FakeApi::new()
            .with_connection(Connection::Refused(401))
            .with_connection(Connection::Refused(401)),
    );
    let store = Arc::new(FlakyStore::new());
    let classifier = StreamClassifier::new(api.clone(), store.clone(), Arc::new(ManualClock::new(t0())))
        .with_reconnect(Box::new(Limited { retries: 1, delay: Duration::ZERO }));

    let stats = timeout(
        Duration::from_secs(5),
        classifier.run(Arc::new(roster()), &CancellationToken::new()),
    )
    .await
    .unwrap();

    assert_eq!(*api.stream_opens.lock().unwrap(), 2);
    assert_eq!(stats.connections, 0);
}
