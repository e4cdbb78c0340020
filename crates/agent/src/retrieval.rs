//! Reference-document retrieval: embedding client, in-memory vector index
//! and the retriever seam used by the turn runtime.

use std::path::{Path, PathBuf};

use aidgent_core::config::{LlmConfig, RetrievalConfig};
use aidgent_core::retrieval::{
    chunk_markdown, cosine_similarity, mmr_select, parse_document, SearchParams, Snippet,
    DEFAULT_DOC_VERSION,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::llm::HttpApi;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub indexed_docs: usize,
    pub chunks: usize,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("document directory `{path}` could not be read: {source}")]
    DocsDir { path: PathBuf, source: std::io::Error },
    #[error("document `{path}` could not be read: {source}")]
    Document { path: PathBuf, source: std::io::Error },
    #[error("embedding request failed: {0}")]
    Embedding(String),
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, params: SearchParams)
        -> Result<Vec<Snippet>, RetrievalError>;

    /// Rebuilds the index from the document source.
    async fn reindex(&self) -> Result<IndexSummary, RetrievalError>;
}

/// Retriever for deployments with retrieval disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRetriever;

#[async_trait]
impl Retriever for NoopRetriever {
    async fn search(
        &self,
        _query: &str,
        _params: SearchParams,
    ) -> Result<Vec<Snippet>, RetrievalError> {
        Ok(Vec::new())
    }

    async fn reindex(&self) -> Result<IndexSummary, RetrievalError> {
        Ok(IndexSummary::default())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// `/embeddings` client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    api: HttpApi,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(api: HttpApi, model: impl Into<String>) -> Self {
        Self { api, model: model.into() }
    }

    pub fn from_config(llm: &LlmConfig, retrieval: &RetrievalConfig) -> Result<Self> {
        Ok(Self::new(HttpApi::from_config(llm)?, retrieval.embedding_model.clone()))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest { model: &self.model, input: texts };
        let mut response: EmbeddingResponse = self.api.post_json("embeddings", &request).await?;
        response.data.sort_by_key(|item| item.index);
        if response.data.len() != texts.len() {
            anyhow::bail!(
                "embedding endpoint returned {} vectors for {} inputs",
                response.data.len(),
                texts.len()
            );
        }
        Ok(response.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Clone, Debug)]
struct IndexedChunk {
    snippet: Snippet,
    vector: Vec<f32>,
}

/// Markdown documents embedded into a vector index held in memory.
pub struct InMemoryRetriever<E> {
    embedder: E,
    docs_dir: PathBuf,
    chunk_target_chars: usize,
    chunk_overlap_chars: usize,
    mmr_lambda: f32,
    index: RwLock<Vec<IndexedChunk>>,
}

impl<E: Embedder> InMemoryRetriever<E> {
    pub fn new(embedder: E, config: &RetrievalConfig) -> Self {
        Self {
            embedder,
            docs_dir: config.docs_dir.clone(),
            chunk_target_chars: config.chunk_target_chars,
            chunk_overlap_chars: config.chunk_overlap_chars,
            mmr_lambda: config.mmr_lambda,
            index: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        self.embedder
            .embed(texts)
            .await
            .map_err(|error| RetrievalError::Embedding(format!("{error:#}")))
    }

    async fn ingest_document(&self, path: &Path) -> Result<Vec<IndexedChunk>, RetrievalError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RetrievalError::Document { path: path.to_path_buf(), source })?;
        let document = parse_document(&raw);
        let doc_id = document
            .meta
            .doc_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
            .unwrap_or_default();
        let title = document.meta.title.clone().unwrap_or_default();
        let version =
            document.meta.version.clone().unwrap_or_else(|| DEFAULT_DOC_VERSION.to_string());

        let chunks =
            chunk_markdown(&document.body, self.chunk_target_chars, self.chunk_overlap_chars);
        let vectors = self.embed(&chunks).await?;

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(position, (text, vector))| IndexedChunk {
                snippet: Snippet {
                    doc_id: doc_id.clone(),
                    title: title.clone(),
                    version: version.clone(),
                    snippet_id: format!("s{}", position + 1),
                    text,
                    score: 0.0,
                },
                vector,
            })
            .collect())
    }
}

#[async_trait]
impl<E: Embedder> Retriever for InMemoryRetriever<E> {
    async fn search(
        &self,
        query: &str,
        params: SearchParams,
    ) -> Result<Vec<Snippet>, RetrievalError> {
        if query.trim().is_empty() || params.top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vector =
            self.embed(&[query.to_string()]).await?.into_iter().next().unwrap_or_default();

        let index = self.index.read().await;
        let mut scored: Vec<(f32, &IndexedChunk)> = index
            .iter()
            .map(|chunk| (cosine_similarity(&chunk.vector, &query_vector), chunk))
            .filter(|(score, _)| *score >= params.min_score)
            .collect();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));
        scored.truncate(params.candidate_pool());

        let picked: Vec<usize> = if params.mmr {
            let vectors: Vec<Vec<f32>> =
                scored.iter().map(|(_, chunk)| chunk.vector.clone()).collect();
            mmr_select(&query_vector, &vectors, params.top_k, self.mmr_lambda)
        } else {
            (0..scored.len().min(params.top_k)).collect()
        };

        let snippets: Vec<Snippet> = picked
            .into_iter()
            .filter_map(|position| scored.get(position))
            .map(|(score, chunk)| Snippet { score: *score, ..chunk.snippet.clone() })
            .collect();

        debug!(
            event_name = "agent.retrieval.search",
            candidates = scored.len(),
            returned = snippets.len(),
            mmr = params.mmr,
            "retrieval search completed"
        );
        Ok(snippets)
    }

    async fn reindex(&self) -> Result<IndexSummary, RetrievalError> {
        let paths = collect_markdown(&self.docs_dir)?;
        let mut rebuilt = Vec::new();
        let mut summary = IndexSummary::default();

        for path in &paths {
            let chunks = self.ingest_document(path).await?;
            summary.indexed_docs += 1;
            summary.chunks += chunks.len();
            rebuilt.extend(chunks);
        }

        *self.index.write().await = rebuilt;
        info!(
            event_name = "agent.retrieval.reindexed",
            docs_dir = %self.docs_dir.display(),
            indexed_docs = summary.indexed_docs,
            chunks = summary.chunks,
            "reference documents indexed"
        );
        Ok(summary)
    }
}

/// Every `*.md` file under `root`, recursively, in path order.
fn collect_markdown(root: &Path) -> Result<Vec<PathBuf>, RetrievalError> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|source| RetrievalError::DocsDir { path: dir.clone(), source })?;
        for entry in entries {
            let path = entry
                .map_err(|source| RetrievalError::DocsDir { path: dir.clone(), source })?
                .path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|extension| extension == "md") {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}
