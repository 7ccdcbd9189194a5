use std::collections::HashMap;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{set_field, DocCursor, DocumentStore, Filter, Result};

/// In-process store. Used by tests and for dry runs.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every document in a collection, in insertion order.
    pub async fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<usize> {
        let written = docs.len();
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
        Ok(written)
    }

    async fn find(&self, collection: &str, filter: Filter) -> Result<DocCursor> {
        let matches: Vec<Value> = self
            .collections
            .read()
            .await
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();
        Ok(stream::iter(matches.into_iter().map(Ok)).boxed())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Filter,
        field: &str,
        value: Value,
    ) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(false);
        };
        match docs.iter_mut().find(|d| filter.matches(d)) {
            Some(doc) => {
                set_field(doc, field, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_update_one_only_touches_matching_document() {
        let store = MemoryStore::new();
        store
            .insert_many("c", vec![json!({"id_str": "1"}), json!({"id_str": "2"})])
            .await
            .unwrap();

        let updated = store
            .update_one("c", Filter::eq("id_str", "2"), "update_1m", json!(7))
            .await
            .unwrap();
        assert!(updated);

        let docs = store.documents("c").await;
        assert!(docs[0].get("update_1m").is_none());
        assert_eq!(docs[1]["update_1m"], json!(7));
    }

    #[tokio::test]
    async fn test_find_on_missing_collection_is_empty() {
        let store = MemoryStore::new();
        let found: Vec<_> = store.find("nope", Filter::All).await.unwrap().collect().await;
        assert!(found.is_empty());
        assert!(!store
            .update_one("nope", Filter::All, "x", json!(1))
            .await
            .unwrap());
    }
}
