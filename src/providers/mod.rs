pub mod error;
pub mod twitter;

#[cfg(test)]
mod tests;

pub use error::{ApiError, Result};
pub use twitter::{Credentials, TwitterClient};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::models::FollowerPage;

/// Maximum page size the timeline endpoint honours.
pub const TIMELINE_PAGE_SIZE: u32 = 200;
/// Cursor value that requests the first page of follower ids.
pub const FIRST_CURSOR: i64 = -1;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Post(Value),
    /// Delete, limit and warning messages interleaved with posts.
    Notice(Value),
}

/// Ends (or yields an error) when the connection drops.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// Everything the harvester needs from the social network. Implementations
/// wait out rate limits themselves instead of surfacing them.
#[async_trait]
pub trait SocialApi: Send + Sync {
    /// Up to `count` most recent posts with id `<= max_id` (no bound when `None`),
    /// newest first.
    async fn user_timeline(&self, handle: &str, max_id: Option<u64>, count: u32)
        -> Result<Vec<Value>>;

    async fn follower_ids(&self, account_id: u64, cursor: i64) -> Result<FollowerPage>;

    async fn get_post(&self, post_id: &str) -> Result<Value>;

    async fn open_stream(&self, follow: &[u64]) -> Result<EventStream>;
}
