use std::env;
use std::path::PathBuf;
use anyhow::{anyhow, Context, Result};
use tokio::time::Duration;

use crate::providers::twitter::{Credentials, DEFAULT_API_BASE, DEFAULT_STREAM_BASE};

const DEFAULT_STORAGE_DIR: &str = "./storage";
const DEFAULT_ROSTER_PATH: &str = "roster/accounts.csv";
const DEFAULT_UPDATER_IDLE_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub api_base: String,
    pub stream_base: String,
    pub storage_dir: PathBuf,
    pub roster_path: PathBuf,
    pub updater_idle: Duration,
}

impl Config {
    /// Read settings from the process environment, after loading `.env` if
    /// one is present.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenv::dotenv() {
            tracing::debug!(error = %e, "No .env file loaded");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("{} not set", key))
        };

        let credentials = Credentials {
            consumer_key: required("TWITTER_CONSUMER_KEY")?,
            consumer_secret: required("TWITTER_CONSUMER_SECRET")?,
            access_token: required("TWITTER_ACCESS_TOKEN")?,
            access_token_secret: required("TWITTER_ACCESS_TOKEN_SECRET")?,
        };

        let updater_idle = match lookup("UPDATER_IDLE_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("UPDATER_IDLE_SECS is not a number: {}", raw))?,
            None => DEFAULT_UPDATER_IDLE_SECS,
        };

        Ok(Config {
            credentials,
            api_base: lookup("TWITTER_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            stream_base: lookup("TWITTER_STREAM_BASE").unwrap_or_else(|| DEFAULT_STREAM_BASE.to_string()),
            storage_dir: lookup("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
            roster_path: lookup("ROSTER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ROSTER_PATH)),
            updater_idle: Duration::from_secs(updater_idle),
        })
    }

    pub fn queue_path(&self) -> PathBuf {
        self.storage_dir.join("follower_queue.json")
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("harvest.sqlite3")
    }
}
