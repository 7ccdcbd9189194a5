use async_trait::async_trait;
use bytes::BytesMut;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::header::HeaderMap;
use reqwest_oauth1::{OAuthClientProvider, Secrets};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::{ApiError, EventStream, Result, SocialApi, StreamEvent};
use crate::models::FollowerPage;

pub const DEFAULT_API_BASE: &str = "https://api.twitter.com/1.1";
pub const DEFAULT_STREAM_BASE: &str = "https://stream.twitter.com/1.1";

// Wait used when a rate-limited response carries no reset header.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_token_secret: String,
}

/// REST/streaming client signed with OAuth 1.0a user credentials.
pub struct TwitterClient {
    http: reqwest::Client,
    credentials: Credentials,
    api_base: String,
    stream_base: String,
}

impl TwitterClient {
    pub fn with_endpoints(credentials: Credentials, api_base: &str, stream_base: &str) -> Self {
        TwitterClient {
            http: reqwest::Client::new(),
            credentials,
            api_base: api_base.trim_end_matches('/').to_string(),
            stream_base: stream_base.trim_end_matches('/').to_string(),
        }
    }

    fn secrets(&self) -> Secrets<'static> {
        Secrets::new(
            self.credentials.consumer_key.clone(),
            self.credentials.consumer_secret.clone(),
        )
        .token(
            self.credentials.access_token.clone(),
            self.credentials.access_token_secret.clone(),
        )
    }

    /// Signed GET that sleeps through rate limiting and resends.
    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.api_base, path);
        loop {
            let response = self
                .http
                .clone()
                .oauth1(self.secrets())
                .get(&url)
                .query(query)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                return Ok(response.json::<T>().await?);
            }

            let wait = rate_limit_wait(response.headers());
            let err = ApiError::from_body(status.as_u16(), &response.text().await.unwrap_or_default());
            if err.is_rate_limited() {
                warn!(path, wait_secs = wait.as_secs(), "Rate limit hit, waiting before retrying");
                sleep(wait).await;
                continue;
            }
            return Err(err);
        }
    }
}

/// Seconds until the window named by `x-rate-limit-reset`, at least one.
fn rate_limit_wait(headers: &HeaderMap) -> Duration {
    headers
        .get("x-rate-limit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .map(|reset| Duration::from_secs((reset - Utc::now().timestamp()).max(1) as u64))
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT)
}

/// Turn one line of the streaming body into an event. A line that is not
/// JSON is logged and surfaced as a notice so the connection stays up.
pub fn parse_stream_message(line: &[u8]) -> Result<StreamEvent> {
    let value: Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(e) => {
            let raw = String::from_utf8_lossy(line).into_owned();
            warn!(error = %e, bytes = line.len(), "Skipping malformed stream message");
            return Ok(StreamEvent::Notice(json!({ "unparsed": raw })));
        }
    };
    if let Some(disconnect) = value.get("disconnect") {
        let reason = disconnect
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("disconnect notice")
            .to_string();
        return Err(ApiError::Disconnected(reason));
    }
    if value.get("id_str").is_some() && value.get("user").is_some() {
        Ok(StreamEvent::Post(value))
    } else {
        Ok(StreamEvent::Notice(value))
    }
}

#[async_trait]
impl SocialApi for TwitterClient {
    async fn user_timeline(
        &self,
        handle: &str,
        max_id: Option<u64>,
        count: u32,
    ) -> Result<Vec<Value>> {
        let mut query = vec![
            ("screen_name", handle.to_string()),
            ("count", count.to_string()),
            ("tweet_mode", "extended".to_string()),
            ("include_rts", "true".to_string()),
        ];
        if let Some(max_id) = max_id {
            query.push(("max_id", max_id.to_string()));
        }
        debug!(handle, ?max_id, count, "Requesting timeline page");
        self.get_json("statuses/user_timeline.json", &query).await
    }

    async fn follower_ids(&self, account_id: u64, cursor: i64) -> Result<FollowerPage> {
        let query = [
            ("user_id", account_id.to_string()),
            ("cursor", cursor.to_string()),
            ("count", "5000".to_string()),
        ];
        self.get_json("followers/ids.json", &query).await
    }

    async fn get_post(&self, post_id: &str) -> Result<Value> {
        let query = [
            ("id", post_id.to_string()),
            ("trim_user", "true".to_string()),
            ("include_entities", "false".to_string()),
            ("tweet_mode", "extended".to_string()),
        ];
        self.get_json("statuses/show.json", &query).await
    }

    async fn open_stream(&self, follow: &[u64]) -> Result<EventStream> {
        let url = format!("{}/statuses/filter.json", self.stream_base);
        let follow = follow
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let form = [("follow", follow), ("tweet_mode", "extended".to_string())];

        let response = self
            .http
            .clone()
            .oauth1(self.secrets())
            .post(&url)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_body(status.as_u16(), &body));
        }
        info!(%url, "Stream connected");

        let body = Box::pin(response.bytes_stream());
        let events = stream::unfold(Some((body, BytesMut::new())), |state| async move {
            let (mut body, mut buf) = state?;
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(pos + 1);
                    // keep-alive newlines
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some((parse_stream_message(&line), Some((body, buf))));
                }
                match body.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(ApiError::from(e)), None)),
                    None => {
                        let err = ApiError::Disconnected("stream closed by server".to_string());
                        return Some((Err(err), None));
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}
