//! In-memory backend: useful for tests and local runs without a database.
//!
//! Each `InMemoryStore` is an isolated instance; clones share the same data.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use super::{
    Document, DocumentPath, DocumentStore, DocumentWrite, FieldQuery, FieldTransform,
    ReadTransaction, SetMode, StoreError,
};

type Documents = BTreeMap<String, Document>;

#[derive(Clone, Default)]
pub struct InMemoryStore {
    documents: Arc<RwLock<Documents>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents across all collections.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn apply(
    existing: Option<&Document>,
    path: &DocumentPath,
    write: DocumentWrite,
    mode: SetMode,
) -> Document {
    let timestamp = now();
    let mut fields = match (existing, mode) {
        (Some(doc), SetMode::Merge) => doc.fields.clone(),
        _ => Default::default(),
    };
    fields.extend(write.fields);

    for (name, transform) in write.transforms {
        let value = match transform {
            FieldTransform::ServerTimestamp => Value::from(timestamp.clone()),
            FieldTransform::Increment(by) => {
                let current = fields.get(&name).and_then(Value::as_i64).unwrap_or(0);
                Value::from(current + by)
            }
        };
        fields.insert(name, value);
    }

    Document {
        id: path.id().to_string(),
        fields,
        create_time: existing
            .and_then(|doc| doc.create_time.clone())
            .or_else(|| Some(timestamp.clone())),
        update_time: Some(timestamp),
    }
}

fn run_query(documents: &Documents, query: &FieldQuery) -> Vec<Document> {
    let prefix = format!("{}/", query.collection);
    let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    documents
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter(|(key, _)| !key[prefix.len()..].contains('/'))
        .filter(|(_, doc)| doc.fields.get(&query.field) == Some(&query.value))
        .map(|(_, doc)| doc.clone())
        .take(limit)
        .collect()
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.read().await.get(&path.to_string()).cloned())
    }

    async fn set(
        &self,
        path: &DocumentPath,
        write: DocumentWrite,
        mode: SetMode,
    ) -> Result<(), StoreError> {
        let key = path.to_string();
        let mut documents = self.documents.write().await;
        let updated = apply(documents.get(&key), path, write, mode);
        documents.insert(key, updated);
        Ok(())
    }

    async fn create(&self, path: &DocumentPath, write: DocumentWrite) -> Result<(), StoreError> {
        let key = path.to_string();
        let mut documents = self.documents.write().await;
        if documents.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let created = apply(None, path, write, SetMode::Overwrite);
        documents.insert(key, created);
        Ok(())
    }

    async fn query(&self, query: &FieldQuery) -> Result<Vec<Document>, StoreError> {
        Ok(run_query(&*self.documents.read().await, query))
    }

    async fn begin_read_only(&self) -> Result<Box<dyn ReadTransaction>, StoreError> {
        let snapshot = self.documents.clone().read_owned().await;
        Ok(Box::new(MemoryReadTransaction { snapshot }))
    }
}

/// Holds the read lock for its lifetime, so writers wait until `finish`.
struct MemoryReadTransaction {
    snapshot: OwnedRwLockReadGuard<Documents>,
}

#[async_trait]
impl ReadTransaction for MemoryReadTransaction {
    async fn get(&mut self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        Ok(self.snapshot.get(&path.to_string()).cloned())
    }

    async fn query(&mut self, query: &FieldQuery) -> Result<Vec<Document>, StoreError> {
        Ok(run_query(&self.snapshot, query))
    }

    async fn finish(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CollectionPath;
    use serde_json::json;

    fn user(id: &str) -> DocumentPath {
        CollectionPath::root("users").doc(id)
    }

    #[tokio::test]
    async fn test_get_missing_document() {
        let store = InMemoryStore::new();
        assert!(store.get(&user("nobody")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_keeps_other_fields() {
        let store = InMemoryStore::new();
        let path = user("u1");
        store
            .set(&path, DocumentWrite::new().field("name", "Taro").field("current_level", 3), SetMode::Merge)
            .await
            .unwrap();
        store
            .set(&path, DocumentWrite::new().field("name", "Hanako"), SetMode::Merge)
            .await
            .unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.id, "u1");
        assert_eq!(doc.get("name"), Some(&json!("Hanako")));
        assert_eq!(doc.get("current_level"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_overwrite_drops_other_fields() {
        let store = InMemoryStore::new();
        let path = user("u1");
        store
            .set(&path, DocumentWrite::new().field("name", "Taro").field("current_level", 3), SetMode::Merge)
            .await
            .unwrap();
        store
            .set(&path, DocumentWrite::new().field("name", "Jiro"), SetMode::Overwrite)
            .await
            .unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.get("current_level"), None);
    }

    #[tokio::test]
    async fn test_create_rejects_existing() {
        let store = InMemoryStore::new();
        let path = user("u1");
        store.create(&path, DocumentWrite::new()).await.unwrap();
        let err = store.create(&path, DocumentWrite::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(key) if key == "users/u1"));
    }

    #[tokio::test]
    async fn test_transforms() {
        let store = InMemoryStore::new();
        let path = user("u1").collection("questions").doc("q1");
        let write = || {
            DocumentWrite::new()
                .increment("correctCount", 1)
                .server_timestamp("updatedAt")
        };
        store.set(&path, write(), SetMode::Merge).await.unwrap();
        store.set(&path, write(), SetMode::Merge).await.unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.get("correctCount"), Some(&json!(2)));
        assert!(doc.get("updatedAt").and_then(Value::as_str).is_some());
        assert!(doc.create_time.is_some());
    }

    #[tokio::test]
    async fn test_query_only_matches_direct_children() {
        let store = InMemoryStore::new();
        let questions = user("u1").collection("questions");
        for (id, level) in [("a", 1), ("b", 2), ("c", 1)] {
            store
                .create(&questions.doc(id), DocumentWrite::new().field("level", level))
                .await
                .unwrap();
        }
        // Same field value in another user's collection must not match.
        store
            .create(
                &user("u2").collection("questions").doc("d"),
                DocumentWrite::new().field("level", 1),
            )
            .await
            .unwrap();

        let found = store
            .query(&FieldQuery::eq(questions.clone(), "level", 1))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let limited = store
            .query(&FieldQuery::eq(questions, "level", 1).limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_read_transaction_sees_snapshot() {
        let store = InMemoryStore::new();
        store
            .set(&user("u1"), DocumentWrite::new().field("current_level", 2), SetMode::Merge)
            .await
            .unwrap();

        let mut tx = store.begin_read_only().await.unwrap();
        let doc = tx.get(&user("u1")).await.unwrap().unwrap();
        assert_eq!(doc.get("current_level"), Some(&json!(2)));
        tx.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let a = InMemoryStore::new();
        let b = InMemoryStore::new();
        a.create(&user("u1"), DocumentWrite::new()).await.unwrap();
        assert!(b.is_empty().await);
        assert_eq!(a.clone().len().await, 1);
    }
}
