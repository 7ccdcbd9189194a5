//! Daily follower-id snapshots, driven by a time-ordered queue.

use std::path::PathBuf;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::clock::Clock;
use crate::core::queue::FollowerQueue;
use crate::core::retry::{retry_when, sleep_or_cancel, Forever, RetryError, RetryPolicy};
use crate::models::{FollowerSnapshot, FOLLOWERS};
use crate::providers::{ApiError, SocialApi, FIRST_CURSOR};
use crate::roster::Roster;
use crate::storage::DocumentStore;

const SNAPSHOT_INTERVAL_HOURS: i64 = 24;
// Longest single sleep while waiting for the head of the queue.
const MAX_IDLE: Duration = Duration::from_secs(60);
// Delay before retrying an account whose snapshot could not be written.
const WRITE_RETRY_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Nothing due before this instant.
    Idle(DateTime<Utc>),
    Empty,
    Snapshotted { account_id: u64, followers: usize },
    WriteFailed { account_id: u64 },
    /// The retry policy gave up; the account stays due.
    FetchFailed { account_id: u64 },
    /// Suspended, protected or deleted; tried again after a full interval.
    Unavailable { account_id: u64 },
    Cancelled,
}

pub struct Snapshotter {
    api: Arc<dyn SocialApi>,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    fetch_retry: Box<dyn RetryPolicy>,
    interval: chrono::Duration,
    queue_path: Option<PathBuf>,
}

impl Snapshotter {
    pub fn new(api: Arc<dyn SocialApi>, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Snapshotter {
            api,
            store,
            clock,
            fetch_retry: Box::new(Forever::new(Duration::from_secs(5), Duration::from_secs(15 * 60))),
            interval: chrono::Duration::hours(SNAPSHOT_INTERVAL_HOURS),
            queue_path: None,
        }
    }

    pub fn with_fetch_retry(mut self, policy: Box<dyn RetryPolicy>) -> Self {
        self.fetch_retry = policy;
        self
    }

    /// Persist the queue here after every cycle and resume from it on start.
    pub fn with_queue_path(mut self, path: PathBuf) -> Self {
        self.queue_path = Some(path);
        self
    }

    pub fn initial_queue(&self, roster: &Roster) -> FollowerQueue {
        let now = self.clock.now();
        let persisted = match &self.queue_path {
            Some(path) => match FollowerQueue::load(path) {
                Ok(queue) => queue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not read saved queue, starting fresh");
                    None
                }
            },
            None => None,
        };
        match persisted {
            Some(mut queue) => {
                queue.reconcile(roster.ids(), now);
                info!(accounts = queue.len(), "Resumed follower queue");
                queue
            }
            None => FollowerQueue::seeded(roster.ids(), now),
        }
    }

    pub async fn run(&self, roster: &Roster, cancel: &CancellationToken) {
        let mut queue = self.initial_queue(roster);
        if queue.is_empty() {
            warn!("No roster account has an id, nothing to snapshot");
        }
        info!(accounts = queue.len(), "Follower snapshotter started");

        loop {
            let wait = match self.step(&mut queue, cancel).await {
                Step::Cancelled => break,
                Step::Idle(until) => (until - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(MAX_IDLE),
                Step::Empty => MAX_IDLE,
                Step::Snapshotted { .. } | Step::WriteFailed { .. } | Step::Unavailable { .. } => continue,
                Step::FetchFailed { .. } => MAX_IDLE,
            };
            if !sleep_or_cancel(cancel, wait).await {
                break;
            }
        }
        info!("Follower snapshotter stopped");
    }

    /// Handle the head of the queue if it is due.
    pub async fn step(&self, queue: &mut FollowerQueue, cancel: &CancellationToken) -> Step {
        if cancel.is_cancelled() {
            return Step::Cancelled;
        }
        let Some(item) = queue.pop_due(self.clock.now()) else {
            return match queue.peek() {
                Some(head) => Step::Idle(head.next_eligible),
                None => Step::Empty,
            };
        };
        let account_id = item.account_id;

        let followers = match self.fetch_followers(account_id, cancel).await {
            Ok(ids) => ids,
            Err(RetryError::Cancelled) => {
                // put it back untouched so a restart picks it up
                queue.push(account_id, item.next_eligible);
                self.persist(queue);
                return Step::Cancelled;
            }
            Err(RetryError::Exhausted(e)) if e.is_account_unavailable() => {
                let next = self.clock.now() + self.interval;
                warn!(account_id, error = %e, next = %next, "Account unavailable, skipping until next cycle");
                queue.push(account_id, next);
                self.persist(queue);
                return Step::Unavailable { account_id };
            }
            Err(RetryError::Exhausted(e)) => {
                warn!(account_id, error = %e, "Error downloading followers");
                queue.push(account_id, item.next_eligible);
                self.persist(queue);
                return Step::FetchFailed { account_id };
            }
        };

        let now = self.clock.now();
        let snapshot = FollowerSnapshot::new(account_id, now, followers);
        let count = snapshot.followers_ids.len();
        let doc = match serde_json::to_value(&snapshot) {
            Ok(doc) => doc,
            Err(e) => {
                error!(account_id, error = %e, "Could not encode snapshot");
                queue.push(account_id, now + chrono::Duration::minutes(WRITE_RETRY_MINUTES));
                self.persist(queue);
                return Step::WriteFailed { account_id };
            }
        };

        if let Err(e) = self.store.insert_one(FOLLOWERS, doc).await {
            error!(account_id, error = %e, "Error inserting follower snapshot");
            queue.push(account_id, now + chrono::Duration::minutes(WRITE_RETRY_MINUTES));
            self.persist(queue);
            return Step::WriteFailed { account_id };
        }

        let completed = self.clock.now();
        queue.push(account_id, completed + self.interval);
        self.persist(queue);
        info!(account_id, followers = count, date = %snapshot.date, "Follower snapshot stored");
        Step::Snapshotted {
            account_id,
            followers: count,
        }
    }

    /// Every follower id for the account. Each retry starts again from the
    /// first page so a snapshot never mixes two partial walks. Unavailable
    /// accounts are not retried.
    pub async fn fetch_followers(
        &self,
        account_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u64>, RetryError<ApiError>> {
        retry_when(
            self.fetch_retry.as_ref(),
            cancel,
            "follower ids",
            |e: &ApiError| !e.is_account_unavailable(),
            || self.collect_follower_ids(account_id),
        )
        .await
    }

    async fn collect_follower_ids(&self, account_id: u64) -> Result<Vec<u64>, ApiError> {
        let mut ids = Vec::new();
        let mut cursor = FIRST_CURSOR;
        loop {
            let page = self.api.follower_ids(account_id, cursor).await?;
            ids.extend(page.ids);
            if page.next_cursor == 0 {
                return Ok(ids);
            }
            cursor = page.next_cursor;
        }
    }

    fn persist(&self, queue: &FollowerQueue) {
        if let Some(path) = &self.queue_path {
            if let Err(e) = queue.save(path) {
                warn!(path = %path.display(), error = %e, "Failed to save follower queue");
            }
        }
    }
}
