//! Realtime stream worker.
//!
//! The connection loop owns the network side and hands posts to a single
//! writer task over a channel, so a slow store never stalls delivery and a
//! dropped connection never loses posts already received.

use std::sync::Arc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::clock::Clock;
use crate::core::retry::{sleep_or_cancel, Forever, RetryPolicy};
use crate::models::{Classification, PostView};
use crate::providers::{EventStream, SocialApi, StreamEvent};
use crate::roster::Roster;
use crate::storage::{DocumentStore, StoreError};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Streaming,
    Reconnecting,
}

/// How a connection ended.
#[derive(Debug)]
enum Teardown {
    Dropped(String),
    Cancelled,
    WriterGone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub connections: usize,
    pub tracked: usize,
    pub incidental: usize,
    pub write_errors: usize,
}

/// Tracked content is an original post written by a roster account.
pub fn classify(post: &Value, roster: &Roster) -> Classification {
    let view = PostView::new(post);
    let tracked_author = view.author_id().map(|id| roster.contains(id)).unwrap_or(false);
    if tracked_author && !view.is_reshare() {
        Classification::TrackedContent
    } else {
        Classification::Incidental
    }
}

pub struct StreamClassifier {
    api: Arc<dyn SocialApi>,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    reconnect: Box<dyn RetryPolicy>,
}

impl StreamClassifier {
    pub fn new(api: Arc<dyn SocialApi>, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        StreamClassifier {
            api,
            store,
            clock,
            reconnect: Box::new(Forever::new(Duration::from_secs(1), Duration::from_secs(5 * 60))),
        }
    }

    pub fn with_reconnect(mut self, policy: Box<dyn RetryPolicy>) -> Self {
        self.reconnect = policy;
        self
    }

    /// Stream until cancelled, reconnecting whenever the connection drops.
    pub async fn run(&self, roster: Arc<Roster>, cancel: &CancellationToken) -> StreamStats {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = tokio::spawn(write_loop(
            Arc::clone(&self.store),
            Arc::clone(&roster),
            Arc::clone(&self.clock),
            rx,
        ));

        let connections = self.connection_loop(&roster, tx, cancel).await;

        let mut stats = match writer.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Stream writer task failed");
                StreamStats::default()
            }
        };
        stats.connections = connections;
        info!(
            connections = stats.connections,
            tracked = stats.tracked,
            incidental = stats.incidental,
            write_errors = stats.write_errors,
            "Stream classifier stopped"
        );
        stats
    }

    async fn connection_loop(
        &self,
        roster: &Roster,
        tx: mpsc::Sender<Value>,
        cancel: &CancellationToken,
    ) -> usize {
        let follow: Vec<u64> = roster.ids().collect();
        let mut state = StreamState::Connecting;
        let mut events: Option<EventStream> = None;
        let mut failures = 0u32;
        let mut connections = 0usize;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match state {
                StreamState::Connecting => {
                    debug!(accounts = follow.len(), "Connecting to stream");
                    let connected = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.api.open_stream(&follow) => result,
                    };
                    match connected {
                        Ok(stream) => {
                            connections += 1;
                            events = Some(stream);
                            state = StreamState::Streaming;
                        }
                        Err(e) => {
                            warn!(error = %e, "Stream connection refused. Relaunching");
                            state = StreamState::Reconnecting;
                        }
                    }
                }
                StreamState::Streaming => {
                    let Some(stream) = events.take() else {
                        state = StreamState::Connecting;
                        continue;
                    };
                    let (delivered, teardown) = self.pump(stream, &tx, cancel).await;
                    if delivered > 0 {
                        failures = 0;
                    }
                    match teardown {
                        Teardown::Cancelled => break,
                        Teardown::WriterGone => {
                            error!("Stream writer stopped, closing stream");
                            break;
                        }
                        Teardown::Dropped(reason) => {
                            warn!(reason = %reason, delivered, "Connection failed. Relaunching");
                            state = StreamState::Reconnecting;
                        }
                    }
                }
                StreamState::Reconnecting => {
                    failures = failures.saturating_add(1);
                    let Some(delay) = self.reconnect.next_delay(failures) else {
                        error!(failures, "Giving up on the stream");
                        break;
                    };
                    debug!(failures, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                    if !sleep_or_cancel(cancel, delay).await {
                        break;
                    }
                    state = StreamState::Connecting;
                }
            }
        }
        connections
    }

    /// Forward posts to the writer until the connection ends.
    async fn pump(
        &self,
        mut events: EventStream,
        tx: &mpsc::Sender<Value>,
        cancel: &CancellationToken,
    ) -> (usize, Teardown) {
        let mut delivered = 0usize;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return (delivered, Teardown::Cancelled),
                next = events.next() => next,
            };
            match next {
                Some(Ok(StreamEvent::Post(post))) => {
                    if tx.send(post).await.is_err() {
                        return (delivered, Teardown::WriterGone);
                    }
                    delivered += 1;
                }
                Some(Ok(StreamEvent::Notice(notice))) => debug!(%notice, "Stream notice"),
                Some(Err(e)) => return (delivered, Teardown::Dropped(e.to_string())),
                None => return (delivered, Teardown::Dropped("stream ended".to_string())),
            }
        }
    }
}

/// Single consumer that classifies and stores every delivered post.
async fn write_loop(
    store: Arc<dyn DocumentStore>,
    roster: Arc<Roster>,
    clock: Arc<dyn Clock>,
    mut rx: mpsc::Receiver<Value>,
) -> StreamStats {
    let mut stats = StreamStats::default();
    while let Some(post) = rx.recv().await {
        let id = PostView::new(&post).id_str().unwrap_or_default();
        match store_post(store.as_ref(), &roster, clock.as_ref(), post).await {
            Ok(Classification::TrackedContent) => {
                stats.tracked += 1;
                info!(id = %id, "Inserted post as content");
            }
            Ok(Classification::Incidental) => {
                stats.incidental += 1;
                info!(id = %id, "Inserted post as extra");
            }
            Err(e) => {
                stats.write_errors += 1;
                error!(id = %id, error = %e, "Failed to store streamed post");
            }
        }
    }
    stats
}

/// Classify one post and append it to the matching collection. Posts without
/// a `timestamp_ms` get the receive time so the metric updater can age them.
pub async fn store_post(
    store: &dyn DocumentStore,
    roster: &Roster,
    clock: &dyn Clock,
    mut post: Value,
) -> Result<Classification, StoreError> {
    let class = classify(&post, roster);
    if let Some(map) = post.as_object_mut() {
        if !map.contains_key("timestamp_ms") {
            map.insert("timestamp_ms".to_string(), Value::String(clock.now_ms().to_string()));
        }
    }
    store.insert_one(class.collection(), post).await?;
    Ok(class)
}
