use serde::{Serialize, Deserialize};
use serde_json::Value;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// Collection holding every post walked by the timeline harvester.
pub const TIMELINES: &str = "timelines";
/// Collection for streamed posts authored by a tracked account.
pub const STREAM_CONTENT: &str = "stream_content";
/// Collection for every other streamed post (reshares, replies from outsiders).
pub const STREAM_EXTRA: &str = "stream_extra";
/// Collection holding daily follower snapshots.
pub const FOLLOWERS: &str = "followers";

/// Like count recorded when a post no longer exists upstream.
pub const SENTINEL_GONE: i64 = -144;
/// Like count recorded when a re-fetch fails for any other reason.
pub const SENTINEL_FAILED: i64 = -999;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TrackedAccount {
    pub id: Option<u64>,
    pub handle: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    TrackedContent,
    Incidental,
}

impl Classification {
    pub fn collection(self) -> &'static str {
        match self {
            Classification::TrackedContent => STREAM_CONTENT,
            Classification::Incidental => STREAM_EXTRA,
        }
    }
}

/// One delay after which a streamed post's like count is sampled again.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricTier {
    OneMinute,
    OneHour,
    OneDay,
    OneWeek,
}

impl MetricTier {
    pub const ALL: [MetricTier; 4] = [
        MetricTier::OneMinute,
        MetricTier::OneHour,
        MetricTier::OneDay,
        MetricTier::OneWeek,
    ];

    pub fn delay_ms(self) -> i64 {
        match self {
            MetricTier::OneMinute => 60_000,
            MetricTier::OneHour => 3_600_000,
            MetricTier::OneDay => 86_400_000,
            MetricTier::OneWeek => 604_800_000,
        }
    }

    pub fn field(self) -> &'static str {
        match self {
            MetricTier::OneMinute => "update_1m",
            MetricTier::OneHour => "update_1h",
            MetricTier::OneDay => "update_1d",
            MetricTier::OneWeek => "update_1w",
        }
    }
}

/// Read-only view over the raw post JSON the API hands back.
///
/// Records are stored exactly as received; this only pulls out the handful of
/// fields the scheduler needs to make decisions.
#[derive(Debug, Clone, Copy)]
pub struct PostView<'a> {
    raw: &'a Value,
}

impl<'a> PostView<'a> {
    pub fn new(raw: &'a Value) -> Self {
        PostView { raw }
    }

    pub fn id_str(&self) -> Option<String> {
        id_field(self.raw, "id_str", "id")
    }

    pub fn id(&self) -> Option<u64> {
        self.id_str().and_then(|id| id.parse().ok())
    }

    pub fn author_id(&self) -> Option<u64> {
        self.raw
            .get("user")
            .and_then(|user| id_field(user, "id_str", "id"))
            .and_then(|id| id.parse().ok())
    }

    pub fn is_reshare(&self) -> bool {
        self.raw
            .get("retweeted_status")
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    /// Like count, 0 when the API omitted the field.
    pub fn like_count(&self) -> i64 {
        self.raw
            .get("favorite_count")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn timestamp_ms(&self) -> Option<i64> {
        self.raw.get("timestamp_ms").and_then(numeric)
    }
}

fn id_field(value: &Value, str_key: &str, num_key: &str) -> Option<String> {
    if let Some(s) = value.get(str_key).and_then(Value::as_str) {
        return Some(s.to_string());
    }
    value.get(num_key).and_then(Value::as_u64).map(|n| n.to_string())
}

/// Numbers stored either as JSON numbers or as digit strings (`"1514764800000"`).
pub fn numeric(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FollowerSnapshot {
    pub polit_id: String,
    pub date: String,
    pub followers_ids: Vec<u64>,
}

impl FollowerSnapshot {
    pub fn new(account_id: u64, taken_at: DateTime<Utc>, followers_ids: Vec<u64>) -> Self {
        FollowerSnapshot {
            polit_id: account_id.to_string(),
            date: taken_at.format("%Y-%m-%d").to_string(),
            followers_ids,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ScheduledWorkItem {
    pub account_id: u64,
    pub next_eligible: DateTime<Utc>,
}

// Reversed so a BinaryHeap pops the earliest eligibility first.
impl Ord for ScheduledWorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .next_eligible
            .cmp(&self.next_eligible)
            .then_with(|| other.account_id.cmp(&self.account_id))
    }
}

impl PartialOrd for ScheduledWorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Page of follower ids; `next_cursor == 0` marks the last page.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct FollowerPage {
    #[serde(default)]
    pub ids: Vec<u64>,
    #[serde(default)]
    pub next_cursor: i64,
}
