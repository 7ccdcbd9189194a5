//! Full-history timeline walk for every tracked handle.

use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::retry::{retry_when, Limited, RetryError, RetryPolicy};
use crate::models::{PostView, TIMELINES};
use crate::providers::{ApiError, SocialApi, TIMELINE_PAGE_SIZE};
use crate::roster::Roster;
use crate::storage::DocumentStore;

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Roster index to start from.
    pub start: usize,
    /// Stop after this many accounts have been processed.
    pub max_accounts: Option<usize>,
    pub page_size: u32,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        HarvestOptions {
            start: 0,
            max_accounts: None,
            page_size: TIMELINE_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountOutcome {
    /// Walked back to the oldest available post.
    Complete,
    /// Suspended, protected or deleted.
    Unavailable,
    /// Some other API failure stopped the walk.
    FetchFailed,
    /// A page could not be written; the rest of the account was skipped.
    WriteFailed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AccountHarvest {
    pub index: usize,
    pub handle: String,
    pub inserted: usize,
    pub requests: usize,
    pub outcome: AccountOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct HarvestReport {
    pub accounts: Vec<AccountHarvest>,
    pub total: usize,
}

pub struct Harvester {
    api: Arc<dyn SocialApi>,
    store: Arc<dyn DocumentStore>,
    page_retry: Box<dyn RetryPolicy>,
}

impl Harvester {
    pub fn new(api: Arc<dyn SocialApi>, store: Arc<dyn DocumentStore>) -> Self {
        Harvester {
            api,
            store,
            page_retry: Box::new(Limited {
                retries: 3,
                delay: Duration::from_secs(5),
            }),
        }
    }

    /// Override how network failures on a page request are retried.
    pub fn with_page_retry(mut self, policy: Box<dyn RetryPolicy>) -> Self {
        self.page_retry = policy;
        self
    }

    pub async fn run(
        &self,
        roster: &Roster,
        options: &HarvestOptions,
        cancel: &CancellationToken,
    ) -> HarvestReport {
        info!(start = options.start, max_accounts = ?options.max_accounts, "Starting to retrieve timelines");
        let mut report = HarvestReport::default();

        for (index, account) in roster.accounts().iter().enumerate().skip(options.start) {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(max) = options.max_accounts {
                if report.accounts.len() >= max {
                    info!(max, "Reached max accounts for this run");
                    break;
                }
            }
            let Some(handle) = account.handle.as_deref() else {
                continue;
            };

            let harvest = self.harvest_account(index, handle, options.page_size, cancel).await;
            info!(
                index,
                handle = %harvest.handle,
                additions = harvest.inserted,
                requests = harvest.requests,
                outcome = ?harvest.outcome,
                "Account done"
            );
            report.total += harvest.inserted;
            report.accounts.push(harvest);
        }

        info!(total = report.total, accounts = report.accounts.len(), "Finished. Timelines retrieved");
        report
    }

    /// Page backwards through one account until an empty page comes back.
    pub async fn harvest_account(
        &self,
        index: usize,
        handle: &str,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> AccountHarvest {
        let handle = handle.trim().to_lowercase();
        let mut harvest = AccountHarvest {
            index,
            handle: handle.clone(),
            inserted: 0,
            requests: 0,
            outcome: AccountOutcome::Complete,
        };
        let mut max_id: Option<u64> = None;

        loop {
            harvest.requests += 1;
            let fetched = retry_when(
                self.page_retry.as_ref(),
                cancel,
                "timeline page",
                ApiError::is_transient,
                || self.api.user_timeline(&handle, max_id, page_size),
            )
            .await;

            let page = match fetched {
                Ok(page) => page,
                Err(RetryError::Cancelled) => {
                    harvest.outcome = AccountOutcome::Cancelled;
                    return harvest;
                }
                Err(RetryError::Exhausted(e)) if e.is_account_unavailable() => {
                    info!(handle = %handle, error = %e, "Unavailable account");
                    harvest.outcome = AccountOutcome::Unavailable;
                    return harvest;
                }
                Err(RetryError::Exhausted(e)) => {
                    warn!(handle = %handle, error = %e, "Timeline fetch failed, skipping account");
                    harvest.outcome = AccountOutcome::FetchFailed;
                    return harvest;
                }
            };

            if page.is_empty() {
                return harvest;
            }

            let Some(next) = next_max_id(&page) else {
                warn!(handle = %handle, "Page ended with a post without an id, stopping");
                harvest.outcome = AccountOutcome::FetchFailed;
                return harvest;
            };

            let count = page.len();
            match self.store.insert_many(TIMELINES, page).await {
                Ok(written) => harvest.inserted += written,
                Err(e) => {
                    error!(handle = %handle, lost = count, error = %e, "Error inserting posts, abandoning account");
                    harvest.outcome = AccountOutcome::WriteFailed;
                    return harvest;
                }
            }
            max_id = Some(next);
        }
    }
}

/// Cursor for the next page: one below the oldest post returned, so the
/// boundary post is not fetched twice.
pub fn next_max_id(page: &[serde_json::Value]) -> Option<u64> {
    let last = PostView::new(page.last()?).id()?;
    Some(last.saturating_sub(1))
}
