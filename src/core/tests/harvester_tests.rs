use std::collections::HashSet;
use std::sync::Arc;
use serde_json::Value;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::fakes::{post, FakeApi, FlakyStore};
use crate::core::harvester::{next_max_id, AccountOutcome, HarvestOptions, Harvester};
use crate::core::retry::Limited;
use crate::models::{TrackedAccount, TIMELINES};
use crate::providers::ApiError;
use crate::roster::Roster;

fn roster(handles: &[&str]) -> Roster {
    Roster::new(
        handles
            .iter()
            .enumerate()
            .map(|(i, h)| TrackedAccount {
                id: Some(i as u64 + 1),
                handle: Some(h.to_string()),
            })
            .collect(),
    )
}

fn posts(range: std::ops::RangeInclusive<u64>, author: u64) -> Vec<Value> {
    range.map(|id| post(id, author)).collect()
}

fn harvester(api: Arc<FakeApi>, store: Arc<FlakyStore>) -> Harvester {
    Harvester::new(api, store).with_page_retry(Box::new(Limited {
        retries: 2,
        delay: Duration::ZERO,
    }))
}

fn stored_ids(docs: &[Value]) -> Vec<u64> {
    docs.iter().filter_map(|d| d["id"].as_u64()).collect()
}

#[tokio::test]
async fn test_small_timeline_is_stored_in_two_requests() {
    let api = Arc::new(FakeApi::new().with_timeline("a", posts(1..=3, 1)));
    let store = Arc::new(FlakyStore::new());

    let report = harvester(api.clone(), store.clone())
        .run(&roster(&["a"]), &HarvestOptions::default(), &CancellationToken::new())
        .await;

    assert_eq!(report.total, 3);
    assert_eq!(store.inner.count(TIMELINES).await, 3);
    assert_eq!(api.timeline_requests(), vec![("a".to_string(), None), ("a".to_string(), Some(0))]);
    assert_eq!(report.accounts[0].outcome, AccountOutcome::Complete);
}

#[tokio::test]
async fn test_full_history_without_duplicates() {
    let api = Arc::new(FakeApi::new().with_timeline("a", posts(1..=450, 1)));
    let store = Arc::new(FlakyStore::new());

    let report = harvester(api.clone(), store.clone())
        .run(&roster(&["a"]), &HarvestOptions::default(), &CancellationToken::new())
        .await;

    // ceil(450 / 200) pages with posts plus the terminating empty page
    assert_eq!(report.accounts[0].requests, 4);
    let max_ids: Vec<Option<u64>> = api.timeline_requests().into_iter().map(|(_, m)| m).collect();
    assert_eq!(max_ids, vec![None, Some(250), Some(50), Some(0)]);

    let ids = stored_ids(&store.inner.documents(TIMELINES).await);
    let unique: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 450);
    assert_eq!(unique.len(), 450);
}

#[tokio::test]
async fn test_boundary_post_is_not_refetched() {
    let page = posts(90..=100, 1).into_iter().rev().collect::<Vec<_>>();
    assert_eq!(next_max_id(&page), Some(89));
    assert_eq!(next_max_id(&[]), None);

    let api = Arc::new(FakeApi::new().with_timeline("a", posts(1..=5, 1)));
    let store = Arc::new(FlakyStore::new());
    let cancel = CancellationToken::new();
    harvester(api.clone(), store.clone())
        .harvest_account(0, "a", 2, &cancel)
        .await;

    let ids = stored_ids(&store.inner.documents(TIMELINES).await);
    assert_eq!(ids, vec![5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn test_handles_are_lowercased() {
    let api = Arc::new(FakeApi::new().with_timeline("mixed", posts(1..=2, 1)));
    let store = Arc::new(FlakyStore::new());

    let harvest = harvester(api.clone(), store.clone())
        .harvest_account(0, " MiXeD ", 200, &CancellationToken::new())
        .await;

    assert_eq!(harvest.handle, "mixed");
    assert_eq!(harvest.inserted, 2);
}

#[tokio::test]
async fn test_unavailable_account_is_skipped() {
    let api = Arc::new(
        FakeApi::new()
            .with_timeline_failure("gone", ApiError::from_body(401, r#"{"error":"Not authorized."}"#))
            .with_timeline("c", posts(10..=12, 3)),
    );
    let store = Arc::new(FlakyStore::new());

    let report = harvester(api.clone(), store.clone())
        .run(&roster(&["gone", "c"]), &HarvestOptions::default(), &CancellationToken::new())
        .await;

    assert_eq!(report.accounts[0].outcome, AccountOutcome::Unavailable);
    assert_eq!(report.accounts[0].requests, 1);
    assert_eq!(report.accounts[1].outcome, AccountOutcome::Complete);
    assert_eq!(store.inner.count(TIMELINES).await, 3);
}

#[tokio::test]
async fn test_network_errors_are_retried() {
    let api = Arc::new(
        FakeApi::new()
            .with_timeline_failure("a", ApiError::Network("reset".to_string()))
            .with_timeline_failure("a", ApiError::Network("reset".to_string()))
            .with_timeline("a", posts(1..=3, 1)),
    );
    let store = Arc::new(FlakyStore::new());

    let harvest = harvester(api.clone(), store.clone())
        .harvest_account(0, "a", 200, &CancellationToken::new())
        .await;

    assert_eq!(harvest.outcome, AccountOutcome::Complete);
    assert_eq!(harvest.inserted, 3);
    assert_eq!(api.timeline_requests().len(), 4);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let api = Arc::new(
        FakeApi::new()
            .with_timeline_failure("a", ApiError::from_body(503, ""))
            .with_timeline_failure("a", ApiError::from_body(500, "<html>oops</html>"))
            .with_timeline("a", posts(1..=3, 1)),
    );
    let store = Arc::new(FlakyStore::new());

    let harvest = harvester(api.clone(), store.clone())
        .harvest_account(0, "a", 200, &CancellationToken::new())
        .await;

    assert_eq!(harvest.outcome, AccountOutcome::Complete);
    assert_eq!(harvest.inserted, 3);
    assert_eq!(api.timeline_requests().len(), 4);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let api = Arc::new(
        FakeApi::new()
            .with_timeline_failure("a", ApiError::from_body(400, r#"{"errors":[{"code":44,"message":"bad"}]}"#))
            .with_timeline("a", posts(1..=3, 1)),
    );
    let store = Arc::new(FlakyStore::new());

    let harvest = harvester(api.clone(), store.clone())
        .harvest_account(0, "a", 200, &CancellationToken::new())
        .await;

    assert_eq!(harvest.outcome, AccountOutcome::FetchFailed);
    assert_eq!(harvest.inserted, 0);
    assert_eq!(api.timeline_requests().len(), 1);
}

#[tokio::test]
async fn test_failed_bulk_write_abandons_only_that_account() {
    let api = Arc::new(
        FakeApi::new()
            .with_timeline("a", posts(1..=5, 1))
            .with_timeline("b", posts(100..=101, 2)),
    );
    let store = Arc::new(FlakyStore::new());
    // second page of "a"
    store.fail_insert_many_call(2);

    let options = HarvestOptions {
        page_size: 2,
        ..HarvestOptions::default()
    };
    let report = harvester(api.clone(), store.clone())
        .run(&roster(&["a", "b"]), &options, &CancellationToken::new())
        .await;

    assert_eq!(report.accounts[0].outcome, AccountOutcome::WriteFailed);
    assert_eq!(report.accounts[0].inserted, 2);
    assert_eq!(report.accounts[1].outcome, AccountOutcome::Complete);
    assert_eq!(report.accounts[1].inserted, 2);

    let ids = stored_ids(&store.inner.documents(TIMELINES).await);
    assert_eq!(ids, vec![5, 4, 101, 100]);
}

#[tokio::test]
async fn test_start_and_max_accounts() {
    let api = Arc::new(
        FakeApi::new()
            .with_timeline("a", posts(1..=1, 1))
            .with_timeline("b", posts(2..=2, 2))
            .with_timeline("c", posts(3..=3, 3))
            .with_timeline("d", posts(4..=4, 4)),
    );
    let store = Arc::new(FlakyStore::new());

    let options = HarvestOptions {
        start: 1,
        max_accounts: Some(2),
        ..HarvestOptions::default()
    };
    let report = harvester(api.clone(), store.clone())
        .run(&roster(&["a", "b", "c", "d"]), &options, &CancellationToken::new())
        .await;

    let handles: Vec<&str> = report.accounts.iter().map(|a| a.handle.as_str()).collect();
    assert_eq!(handles, vec!["b", "c"]);
    assert_eq!(report.accounts[0].index, 1);
    assert_eq!(report.total, 2);
}

#[tokio::test]
async fn test_accounts_without_handle_are_skipped() {
    let api = Arc::new(FakeApi::new().with_timeline("b", posts(1..=1, 2)));
    let store = Arc::new(FlakyStore::new());
    let roster = Roster::new(vec![
        TrackedAccount { id: Some(1), handle: None },
        TrackedAccount { id: Some(2), handle: Some("b".to_string()) },
    ]);

    let report = harvester(api.clone(), store.clone())
        .run(&roster, &HarvestOptions::default(), &CancellationToken::new())
        .await;

    assert_eq!(report.accounts.len(), 1);
    assert_eq!(report.total, 1);
}
