//! Document store seam.
//!
//! The scheduler only needs point inserts, bulk inserts, filtered scans that
//! return a lazy cursor, and single-field updates. Everything is keyed by
//! collection name and stored as raw JSON.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::models::numeric;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Lazy scan result. Items can fail individually, after which the cursor is
/// not expected to yield anything useful.
pub type DocCursor = BoxStream<'static, Result<Value>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Cursor lost: {0}")]
    CursorLost(String),

    #[error("Write rejected: {0}")]
    WriteRejected(String),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<()>;

    /// Insert all documents; returns how many were written.
    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<usize>;

    async fn find(&self, collection: &str, filter: Filter) -> Result<DocCursor>;

    /// Set `field` on the first document matching `filter`. Returns whether a
    /// document matched.
    async fn update_one(
        &self,
        collection: &str,
        filter: Filter,
        field: &str,
        value: Value,
    ) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    Absent(String),
    /// Numeric `<=`; numeric strings compare by value.
    AtMost(String, i64),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn absent(field: &str) -> Self {
        Filter::Absent(field.to_string())
    }

    pub fn at_most(field: &str, bound: i64) -> Self {
        Filter::AtMost(field.to_string(), bound)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, expected) => doc.get(field) == Some(expected),
            Filter::Absent(field) => doc.get(field).is_none(),
            Filter::AtMost(field, bound) => doc
                .get(field)
                .and_then(numeric)
                .map(|n| n <= *bound)
                .unwrap_or(false),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }
}

fn set_field(doc: &mut Value, field: &str, value: Value) -> Result<()> {
    match doc.as_object_mut() {
        Some(map) => {
            map.insert(field.to_string(), value);
            Ok(())
        }
        None => Err(StoreError::WriteRejected(format!(
            "cannot set '{}' on a non-object document",
            field
        ))),
    }
}
