//! Delayed like-count sampling for streamed tracked content.
//!
//! Every tier field ends up holding exactly one terminal value: the like
//! count observed once the tier's delay has passed, or a negative sentinel
//! when the post could not be re-fetched. Writes are conditional on the field
//! still being absent.

use std::collections::HashMap;
use std::sync::Arc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::clock::Clock;
use crate::core::retry::sleep_or_cancel;
use crate::models::{MetricTier, PostView, SENTINEL_FAILED, SENTINEL_GONE, STREAM_CONTENT};
use crate::providers::{ApiError, SocialApi};
use crate::storage::{DocumentStore, Filter};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierReport {
    pub updated: usize,
    pub gone: usize,
    pub failed: usize,
    /// The scan broke off before reaching the end.
    pub scan_aborted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub tiers: HashMap<MetricTier, TierReport>,
}

impl PassReport {
    pub fn resolved(&self) -> usize {
        self.tiers
            .values()
            .map(|t| t.updated + t.gone + t.failed)
            .sum()
    }
}

/// Value recorded for a tier given the outcome of the re-fetch.
pub fn resolve(outcome: &Result<Value, ApiError>) -> i64 {
    match outcome {
        Ok(post) => PostView::new(post).like_count(),
        Err(e) if e.is_not_found() => SENTINEL_GONE,
        Err(_) => SENTINEL_FAILED,
    }
}

pub struct MetricUpdater {
    api: Arc<dyn SocialApi>,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    idle: Duration,
}

impl MetricUpdater {
    pub fn new(api: Arc<dyn SocialApi>, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        MetricUpdater {
            api,
            store,
            clock,
            idle: Duration::from_secs(10),
        }
    }

    /// Pause between passes.
    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub async fn run(&self, cancel: &CancellationToken) {
        info!("Metric updater started");
        while !cancel.is_cancelled() {
            let report = self.pass(cancel).await;
            debug!(resolved = report.resolved(), "Update pass finished");
            if !sleep_or_cancel(cancel, self.idle).await {
                break;
            }
        }
        info!("Metric updater stopped");
    }

    /// One sweep over every tier, in order.
    pub async fn pass(&self, cancel: &CancellationToken) -> PassReport {
        let mut report = PassReport::default();
        for tier in MetricTier::ALL {
            if cancel.is_cancelled() {
                break;
            }
            let tier_report = self.update_tier(tier, cancel).await;
            report.tiers.insert(tier, tier_report);
        }
        report
    }

    pub async fn update_tier(&self, tier: MetricTier, cancel: &CancellationToken) -> TierReport {
        let mut report = TierReport::default();
        let field = tier.field();
        let cutoff = self.clock.now_ms() - tier.delay_ms();
        debug!(field, "Performing search for due posts");

        let filter = Filter::And(vec![Filter::absent(field), Filter::at_most("timestamp_ms", cutoff)]);
        let mut cursor = match self.store.find(STREAM_CONTENT, filter).await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(field, error = %e, "Scan failed to start, some posts were left without update");
                report.scan_aborted = true;
                return report;
            }
        };

        while let Some(next) = cursor.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let doc = match next {
                Ok(doc) => doc,
                Err(e) => {
                    error!(field, error = %e, "Cursor lost, some posts were left without update");
                    report.scan_aborted = true;
                    break;
                }
            };
            let Some(post_id) = PostView::new(&doc).id_str() else {
                warn!(field, "Skipping stored post without an id");
                continue;
            };

            debug!(post_id = %post_id, field, "Getting updated status");
            let outcome = self.api.get_post(&post_id).await;
            let value = resolve(&outcome);
            match &outcome {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    info!(post_id = %post_id, field, "Post no longer exists, recording sentinel");
                }
                Err(e) => {
                    warn!(post_id = %post_id, field, error = %e, "Could not update post, recording sentinel");
                }
            }

            let key = Filter::And(vec![Filter::eq("id_str", post_id.clone()), Filter::absent(field)]);
            match self.store.update_one(STREAM_CONTENT, key, field, json!(value)).await {
                Ok(true) => {
                    match value {
                        SENTINEL_GONE => report.gone += 1,
                        SENTINEL_FAILED => report.failed += 1,
                        _ => report.updated += 1,
                    }
                    let added = PostView::new(&doc).timestamp_ms().unwrap_or_default();
                    info!(post_id = %post_id, field, value, added_ms = added, "Updated post");
                }
                Ok(false) => debug!(post_id = %post_id, field, "Field already set, leaving it"),
                Err(e) => error!(post_id = %post_id, field, error = %e, "Failed to record update"),
            }
        }
        info!(
            field,
            updated = report.updated,
            gone = report.gone,
            failed = report.failed,
            aborted = report.scan_aborted,
            "Tier pass finished"
        );
        report
    }
}
