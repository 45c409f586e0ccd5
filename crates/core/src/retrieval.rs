//! Document Retrieval
//!
//! A small similarity search over a fixed set of ingested web pages. Pages are
//! fetched once, reduced to plain text, split into overlapping chunks and
//! embedded; queries are embedded the same way and matched by cosine
//! similarity against the in-memory index.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::credentials::{AuthError, TokenProvider};

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";
pub const CHUNK_SIZE: usize = 1000;
pub const CHUNK_OVERLAP: usize = 100;
pub const TOP_K: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Embedding request failed ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

/// How a text will be used; embedding models tune vectors per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingTask {
    Document,
    Query,
}

impl EmbeddingTask {
    fn as_vertex(self) -> &'static str {
        match self {
            EmbeddingTask::Document => "RETRIEVAL_DOCUMENT",
            EmbeddingTask::Query => "RETRIEVAL_QUERY",
        }
    }
}

/// Turns texts into vectors, one per input, in input order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(
        &self,
        texts: Vec<String>,
        task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, RetrievalError>;
}

/// Vertex AI text embeddings through the publisher model `:predict` endpoint.
pub struct VertexEmbedder {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    predict_url: String,
    batch_size: usize,
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct Prediction {
    embeddings: Embeddings,
}

#[derive(Deserialize)]
struct Embeddings {
    values: Vec<f32>,
}

impl VertexEmbedder {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
        project_id: &str,
        region: &str,
        model: &str,
    ) -> Self {
        let endpoint = format!("https://{}-aiplatform.googleapis.com", region);
        Self::with_endpoint(http, tokens, &endpoint, project_id, region, model)
    }

    pub fn with_endpoint(
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
        endpoint: &str,
        project_id: &str,
        region: &str,
        model: &str,
    ) -> Self {
        let predict_url = format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:predict",
            endpoint.trim_end_matches('/'),
            project_id,
            region,
            model
        );
        Self {
            http,
            tokens,
            predict_url,
            batch_size: 16,
        }
    }

    async fn predict(
        &self,
        texts: &[String],
        task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let instances: Vec<_> = texts
            .iter()
            .map(|text| json!({ "content": text, "task_type": task.as_vertex() }))
            .collect();
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(&self.predict_url)
            .bearer_auth(token)
            .json(&json!({ "instances": instances }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: PredictResponse = response.json().await?;
        Ok(parsed
            .predictions
            .into_iter()
            .map(|p| p.embeddings.values)
            .collect())
    }
}

#[async_trait]
impl Embedder for VertexEmbedder {
    async fn embed(
        &self,
        texts: Vec<String>,
        task: EmbeddingTask,
    ) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embedded = self.predict(batch, task).await?;
            if embedded.len() != batch.len() {
                return Err(RetrievalError::CountMismatch {
                    expected: batch.len(),
                    actual: embedded.len(),
                });
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }
}

/// A chunk returned by a search.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub source: String,
    pub content: String,
    pub score: f32,
}

struct IndexedChunk {
    source: String,
    content: String,
    embedding: Vec<f32>,
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: RwLock<Vec<IndexedChunk>>,
    top_k: usize,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            index: RwLock::new(Vec::new()),
            top_k: TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Number of indexed chunks.
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Splits, embeds and indexes a plain-text document. Returns the chunk count.
    pub async fn ingest_text(&self, source: &str, text: &str) -> Result<usize, RetrievalError> {
        let chunks = split_text(text, CHUNK_SIZE, CHUNK_OVERLAP);
        if chunks.is_empty() {
            return Ok(0);
        }
        let embeddings = self
            .embedder
            .embed(chunks.clone(), EmbeddingTask::Document)
            .await?;
        if embeddings.len() != chunks.len() {
            return Err(RetrievalError::CountMismatch {
                expected: chunks.len(),
                actual: embeddings.len(),
            });
        }

        let count = chunks.len();
        let mut index = self.index.write().await;
        index.extend(
            chunks
                .into_iter()
                .zip(embeddings)
                .map(|(content, embedding)| IndexedChunk {
                    source: source.to_string(),
                    content,
                    embedding,
                }),
        );
        debug!(source, chunks = count, "Indexed document");
        Ok(count)
    }

    /// Fetches each URL, strips its markup and indexes the text.
    pub async fn ingest_urls(
        &self,
        http: &reqwest::Client,
        urls: &[String],
    ) -> Result<usize, RetrievalError> {
        let mut total = 0;
        for url in urls {
            let html = http.get(url).send().await?.error_for_status()?.text().await?;
            total += self.ingest_text(url, &strip_markup(&html)).await?;
        }
        info!(urls = urls.len(), chunks = total, "Retrieval index built");
        Ok(total)
    }

    /// The `top_k` chunks most similar to the query, best first.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let query_embedding = self
            .embedder
            .embed(vec![query.to_string()], EmbeddingTask::Query)
            .await?
            .into_iter()
            .next()
            .ok_or(RetrievalError::CountMismatch {
                expected: 1,
                actual: 0,
            })?;

        let index = self.index.read().await;
        let mut scored: Vec<RetrievedChunk> = index
            .iter()
            .map(|chunk| RetrievedChunk {
                source: chunk.source.clone(),
                content: chunk.content.clone(),
                score: cosine_similarity(&query_embedding, &chunk.embedding),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(self.top_k);
        Ok(scored)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Splits text into windows of at most `chunk_size` characters, each sharing
/// `overlap` characters with the previous one.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let chunk_size = chunk_size.max(1);
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

static NON_CONTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|head)\b.*?</(script|style|noscript|head)>|<!--.*?-->")
        .expect("valid regex")
});
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Reduces an HTML page to its visible text.
pub fn strip_markup(html: &str) -> String {
    let text = NON_CONTENT.replace_all(html, " ");
    let text = TAG.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Renders retrieved chunks as a context block for the model.
pub fn format_docs(docs: &[RetrievedChunk]) -> String {
    let mut out = String::from("## Context provided:\n");
    for (i, doc) in docs.iter().enumerate() {
        out.push_str(&format!("<Document {}>\n{}\n</Document {}>\n", i, doc.content, i));
    }
    out
}
