//! Firestore backend over the REST API (v1).
//!
//! Documents are read with `GET`, written with `:commit` (update masks give
//! merge semantics, field transforms give server timestamps and increments),
//! queried with `:runQuery`, and read consistently through read-only
//! transactions from `:beginTransaction`.

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::debug;

use super::{
    Document, DocumentPath, DocumentStore, DocumentWrite, FieldQuery,
    FieldTransform, ReadTransaction, SetMode, StoreError,
};
use crate::credentials::TokenProvider;

pub const FIRESTORE_ENDPOINT: &str = "https://firestore.googleapis.com";

/// Everything except RFC 3986 unreserved characters is escaped; an id stays
/// inside its own path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn url_path(path: &DocumentPath) -> String {
    path.segments()
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Clone)]
pub struct FirestoreStore {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    /// `projects/{project}/databases/{database}`
    database_name: String,
    /// `{endpoint}/v1/{database_name}/documents`
    documents_url: String,
}

impl FirestoreStore {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
        project_id: &str,
        database: &str,
    ) -> Self {
        Self::with_endpoint(http, tokens, FIRESTORE_ENDPOINT, project_id, database)
    }

    /// Targets a different endpoint, e.g. `http://localhost:8080` for the emulator.
    pub fn with_endpoint(
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
        endpoint: &str,
        project_id: &str,
        database: &str,
    ) -> Self {
        let database_name = format!("projects/{}/databases/{}", project_id, database);
        let documents_url = format!(
            "{}/v1/{}/documents",
            endpoint.trim_end_matches('/'),
            database_name
        );
        Self {
            inner: Arc::new(Inner {
                http,
                tokens,
                database_name,
                documents_url,
            }),
        }
    }
}

impl Inner {
    fn document_name(&self, path: &DocumentPath) -> String {
        format!("{}/documents/{}", self.database_name, path)
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response, StoreError> {
        let token = self.tokens.access_token().await?;
        Ok(self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?)
    }

    async fn get_document(
        &self,
        path: &DocumentPath,
        transaction: Option<&str>,
    ) -> Result<Option<Document>, StoreError> {
        let token = self.tokens.access_token().await?;
        let mut request = self
            .http
            .get(format!("{}/{}", self.documents_url, url_path(path)))
            .bearer_auth(token);
        if let Some(tx) = transaction {
            request = request.query(&[("transaction", tx)]);
        }
        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw: RawDocument = check(response).await?.json().await?;
        Ok(Some(raw.into_document()?))
    }

    async fn commit(&self, write: Value) -> Result<(), StoreError> {
        let url = format!("{}:commit", self.documents_url);
        let response = self.post(&url, &json!({ "writes": [write] })).await?;
        check(response).await?;
        Ok(())
    }

    async fn run_query(
        &self,
        query: &FieldQuery,
        transaction: Option<&str>,
    ) -> Result<Vec<Document>, StoreError> {
        let url = match query.collection.parent() {
            Some(parent) => format!("{}/{}:runQuery", self.documents_url, url_path(&parent)),
            None => format!("{}:runQuery", self.documents_url),
        };
        let mut structured = json!({
            "from": [{ "collectionId": query.collection.id() }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": quote_field_path(&query.field) },
                    "op": "EQUAL",
                    "value": encode_value(&query.value),
                }
            },
        });
        if let Some(limit) = query.limit {
            structured["limit"] = json!(limit);
        }
        let mut body = json!({ "structuredQuery": structured });
        if let Some(tx) = transaction {
            body["transaction"] = json!(tx);
        }

        let response = self.post(&url, &body).await?;
        let results: Vec<RunQueryResponse> = check(response).await?.json().await?;
        results
            .into_iter()
            .filter_map(|r| r.document)
            .map(RawDocument::into_document)
            .collect()
    }
}

/// Converts a write into a Firestore `Write` object.
fn encode_write(
    name: String,
    write: DocumentWrite,
    mode: SetMode,
    must_not_exist: bool,
) -> Value {
    let mask: Vec<String> = write.fields.keys().map(|k| quote_field_path(k)).collect();
    let fields: Map<String, Value> = write
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect();

    let mut encoded = json!({
        "update": { "name": name, "fields": fields },
    });
    if mode == SetMode::Merge {
        encoded["updateMask"] = json!({ "fieldPaths": mask });
    }
    if !write.transforms.is_empty() {
        let transforms: Vec<Value> = write
            .transforms
            .iter()
            .map(|(field, transform)| match transform {
                FieldTransform::ServerTimestamp => json!({
                    "fieldPath": quote_field_path(field),
                    "setToServerValue": "REQUEST_TIME",
                }),
                FieldTransform::Increment(by) => json!({
                    "fieldPath": quote_field_path(field),
                    "increment": { "integerValue": by.to_string() },
                }),
            })
            .collect();
        encoded["updateTransforms"] = Value::Array(transforms);
    }
    if must_not_exist {
        encoded["currentDocument"] = json!({ "exists": false });
    }
    encoded
}

/// Field names outside `[A-Za-z_][A-Za-z0-9_]*` must be back-quoted.
fn quote_field_path(field: &str) -> String {
    let simple = field
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        field.to_string()
    } else {
        format!("`{}`", field.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

/// Encodes a JSON value as a Firestore typed `Value`.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({
            "mapValue": {
                "fields": map.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect::<Map<_, _>>()
            }
        }),
    }
}

/// Decodes a Firestore typed `Value` into plain JSON.
///
/// Timestamps, references and bytes come back as strings.
pub fn decode_value(value: &Value) -> Result<Value, StoreError> {
    let object = value
        .as_object()
        .ok_or_else(|| StoreError::Decode(format!("expected typed value, got {}", value)))?;
    let (kind, inner) = object
        .iter()
        .next()
        .ok_or_else(|| StoreError::Decode("empty typed value".to_string()))?;

    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" | "doubleValue" | "geoPointValue" => Ok(inner.clone()),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => Ok(inner.clone()),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            };
            parsed
                .map(Value::from)
                .ok_or_else(|| StoreError::Decode(format!("bad integerValue {}", inner)))
        }
        "arrayValue" => {
            let values = inner
                .get("values")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(decode_value).collect::<Result<Vec<_>, _>>())
                .transpose()?
                .unwrap_or_default();
            Ok(Value::Array(values))
        }
        "mapValue" => Ok(Value::Object(decode_fields(inner.get("fields"))?)),
        other => Err(StoreError::Decode(format!("unsupported value type '{}'", other))),
    }
}

fn decode_fields(fields: Option<&Value>) -> Result<Map<String, Value>, StoreError> {
    match fields.and_then(Value::as_object) {
        Some(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
            .collect(),
        None => Ok(Map::new()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Option<Value>,
    create_time: Option<String>,
    update_time: Option<String>,
}

impl RawDocument {
    fn into_document(self) -> Result<Document, StoreError> {
        let id = self
            .name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(Document {
            id,
            fields: decode_fields(self.fields.as_ref())?,
            create_time: self.create_time,
            update_time: self.update_time,
        })
    }
}

#[derive(Deserialize)]
struct RunQueryResponse {
    document: Option<RawDocument>,
}

#[derive(Deserialize)]
struct BeginTransactionResponse {
    transaction: String,
}

/// Turns a non-success response into a `StoreError`.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or(body);
    if status == reqwest::StatusCode::CONFLICT {
        return Err(StoreError::AlreadyExists(message));
    }
    Err(StoreError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    fn name(&self) -> &str {
        "firestore"
    }

    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        self.inner.get_document(path, None).await
    }

    async fn set(
        &self,
        path: &DocumentPath,
        write: DocumentWrite,
        mode: SetMode,
    ) -> Result<(), StoreError> {
        debug!(%path, ?mode, "Committing document write");
        let write = encode_write(self.inner.document_name(path), write, mode, false);
        self.inner.commit(write).await
    }

    async fn create(&self, path: &DocumentPath, write: DocumentWrite) -> Result<(), StoreError> {
        debug!(%path, "Creating document");
        let write = encode_write(
            self.inner.document_name(path),
            write,
            SetMode::Overwrite,
            true,
        );
        self.inner.commit(write).await
    }

    async fn query(&self, query: &FieldQuery) -> Result<Vec<Document>, StoreError> {
        self.inner.run_query(query, None).await
    }

    async fn begin_read_only(&self) -> Result<Box<dyn ReadTransaction>, StoreError> {
        let url = format!("{}:beginTransaction", self.inner.documents_url);
        let response = self
            .inner
            .post(&url, &json!({ "options": { "readOnly": {} } }))
            .await?;
        let begun: BeginTransactionResponse = check(response).await?.json().await?;
        Ok(Box::new(FirestoreReadTransaction {
            inner: self.inner.clone(),
            id: begun.transaction,
        }))
    }
}

struct FirestoreReadTransaction {
    inner: Arc<Inner>,
    id: String,
}

#[async_trait]
impl ReadTransaction for FirestoreReadTransaction {
    async fn get(&mut self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        self.inner.get_document(path, Some(self.id.as_str())).await
    }

    async fn query(&mut self, query: &FieldQuery) -> Result<Vec<Document>, StoreError> {
        self.inner.run_query(query, Some(self.id.as_str())).await
    }

    async fn finish(self: Box<Self>) -> Result<(), StoreError> {
        let url = format!("{}:rollback", self.inner.documents_url);
        let response = self
            .inner
            .post(&url, &json!({ "transaction": self.id }))
            .await?;
        check(response).await?;
        Ok(())
    }
}

impl std::fmt::Debug for FirestoreStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirestoreStore")
            .field("database", &self.inner.database_name)
            .finish()
    }
}
