//! Document Store Abstraction
//!
//! The tutor keeps its state in a schemaless document database addressed by
//! hierarchical keys (`users/{user_id}/questions/{question_id}`). This module
//! defines the injectable `DocumentStore` interface used by the repository,
//! together with the path, document and write types shared by all backends.
//!
//! Two backends are provided:
//! - `memory`: an isolated in-process store, used by tests and local runs.
//! - `firestore`: the managed Firestore database over its REST API.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Map, Value};
use std::fmt;

use crate::credentials::AuthError;

const AUTO_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const AUTO_ID_LEN: usize = 20;

/// Generates a 20-character alphanumeric document id, the same shape the
/// Firestore client libraries generate for `add()`.
pub fn auto_id() -> String {
    let mut rng = rand::rng();
    (0..AUTO_ID_LEN)
        .map(|_| AUTO_ID_ALPHABET[rng.random_range(0..AUTO_ID_ALPHABET.len())] as char)
        .collect()
}

/// Longest document id Firestore accepts, in bytes.
const MAX_ID_BYTES: usize = 1500;

/// Checks that `id` can address exactly one document: non-empty, a single
/// path segment, and not one of the ids Firestore reserves.
pub fn check_document_id(id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err("must not be empty".to_string());
    }
    if id.contains('/') {
        return Err("must not contain '/'".to_string());
    }
    if id == "." || id == ".." {
        return Err("must not be '.' or '..'".to_string());
    }
    if id.len() >= 4 && id.starts_with("__") && id.ends_with("__") {
        return Err("must not start and end with '__'".to_string());
    }
    if id.len() > MAX_ID_BYTES {
        return Err(format!("must be at most {} bytes", MAX_ID_BYTES));
    }
    Ok(())
}

/// Errors surfaced by a `DocumentStore` backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Document already exists: {0}")]
    AlreadyExists(String),
    #[error("Document store unavailable: {0}")]
    Unavailable(String),
    #[error("Document store rejected the request ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("Failed to decode document data: {0}")]
    Decode(String),
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Path to a single document, e.g. `users/u1` or `users/u1/questions/q1`.
///
/// Always holds an even number of segments (collection, id, collection, id...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    segments: Vec<String>,
}

/// Path to a collection, e.g. `users` or `users/u1/questions`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath {
    segments: Vec<String>,
}

impl CollectionPath {
    /// A top-level collection.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            segments: vec![name.into()],
        }
    }

    pub fn doc(&self, id: impl Into<String>) -> DocumentPath {
        let mut segments = self.segments.clone();
        segments.push(id.into());
        DocumentPath { segments }
    }

    /// The collection id (last segment).
    pub fn id(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// The document that owns this collection, if it is a sub-collection.
    pub fn parent(&self) -> Option<DocumentPath> {
        if self.segments.len() < 3 {
            return None;
        }
        Some(DocumentPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }
}

impl DocumentPath {
    pub fn collection(&self, name: impl Into<String>) -> CollectionPath {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        CollectionPath { segments }
    }

    /// The document id (last segment).
    pub fn id(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(String::as_str)
    }

    pub fn parent(&self) -> CollectionPath {
        CollectionPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// A document as read back from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
    /// RFC 3339 timestamps maintained by the backend.
    pub create_time: Option<String>,
    pub update_time: Option<String>,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// A field transform applied by the backend at write time.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldTransform {
    /// Replace the field with the commit time of the write.
    ServerTimestamp,
    /// Add to the field's integer value, treating a missing field as 0.
    Increment(i64),
}

/// A set of field values and transforms to apply to a single document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentWrite {
    pub fields: Map<String, Value>,
    pub transforms: Vec<(String, FieldTransform)>,
}

impl DocumentWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn server_timestamp(mut self, name: impl Into<String>) -> Self {
        self.transforms
            .push((name.into(), FieldTransform::ServerTimestamp));
        self
    }

    pub fn increment(mut self, name: impl Into<String>, by: i64) -> Self {
        self.transforms
            .push((name.into(), FieldTransform::Increment(by)));
        self
    }
}

/// How `set` combines the write with an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Only the written fields change; other fields are kept.
    Merge,
    /// The document is replaced by the written fields.
    Overwrite,
}

/// A single-field equality query over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldQuery {
    pub collection: CollectionPath,
    pub field: String,
    pub value: Value,
    pub limit: Option<u32>,
}

impl FieldQuery {
    pub fn eq(collection: CollectionPath, field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            collection,
            field: field.into(),
            value: value.into(),
            limit: None,
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A read-only transaction: every read observes the same snapshot.
///
/// It provides no write protection; it only guarantees consistency between the
/// reads made through it.
#[async_trait]
pub trait ReadTransaction: Send {
    async fn get(&mut self, path: &DocumentPath) -> Result<Option<Document>, StoreError>;

    async fn query(&mut self, query: &FieldQuery) -> Result<Vec<Document>, StoreError>;

    /// Releases the snapshot.
    async fn finish(self: Box<Self>) -> Result<(), StoreError>;
}

/// The capability set the tutor needs from a document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// A short backend name for logs.
    fn name(&self) -> &str;

    /// Reads one document; `None` if it does not exist.
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError>;

    /// Writes a document, creating it if absent.
    async fn set(
        &self,
        path: &DocumentPath,
        write: DocumentWrite,
        mode: SetMode,
    ) -> Result<(), StoreError>;

    /// Creates a document; fails with `AlreadyExists` if it is present.
    async fn create(&self, path: &DocumentPath, write: DocumentWrite) -> Result<(), StoreError>;

    /// Runs a single-field equality query.
    async fn query(&self, query: &FieldQuery) -> Result<Vec<Document>, StoreError>;

    /// Starts a read-only transaction.
    async fn begin_read_only(&self) -> Result<Box<dyn ReadTransaction>, StoreError>;
}
