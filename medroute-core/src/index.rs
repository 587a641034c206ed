//! Knowledge index abstraction and an in-memory implementation.
//!
//! The index stores embedded text chunks tagged with a partition (and
//! optionally an owner) and exposes similarity search plus a version marker
//! that increases on every write. The response cache keys on that version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::embeddings::{Embedder, cosine_similarity};
use crate::error::{IndexError, MedRouteError};

/// Restricts a search to a partition and, optionally, a single owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub partition: Option<String>,
    pub owner: Option<String>,
}

impl SearchFilter {
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            partition: Some(partition.into()),
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub source_id: String,
    pub text: String,
    pub partition: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub similarity: f32,
}

/// Vector-searchable store of embedded chunks.
#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    /// Return up to `top_k` hits for `embedding`, most similar first.
    async fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        top_k: usize,
    ) -> Result<Vec<IndexHit>, IndexError>;

    /// Monotonically increasing version, bumped on every content change.
    fn version(&self) -> u64;
}

/// A document as supplied to the index, before chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub source_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl KnowledgeDocument {
    pub fn new(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            text: text.into(),
            partition: None,
            owner: None,
            updated_at: None,
        }
    }

    pub fn in_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }
}

#[derive(Debug, Clone)]
struct IndexedChunk {
    source_id: String,
    text: String,
    partition: Option<String>,
    owner: Option<String>,
    updated_at: DateTime<Utc>,
    embedding: Vec<f32>,
}

/// Split `text` into windows of `size` words overlapping by `overlap` words.
pub fn chunk_words(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || size == 0 {
        return Vec::new();
    }
    if words.len() <= size {
        return vec![words.join(" ")];
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Brute-force in-memory index.
pub struct InMemoryKnowledgeIndex {
    embedder: Arc<dyn Embedder>,
    chunks: RwLock<Vec<IndexedChunk>>,
    version: AtomicU64,
    available: AtomicBool,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl InMemoryKnowledgeIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            chunks: RwLock::new(Vec::new()),
            version: AtomicU64::new(1),
            available: AtomicBool::new(true),
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }

    pub fn with_chunking(mut self, size: usize, overlap: usize) -> Self {
        self.chunk_size = size.max(1);
        self.chunk_overlap = overlap.min(self.chunk_size.saturating_sub(1));
        self
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Simulate an outage. While unavailable every search fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a document. Returns the number of chunks stored.
    pub fn upsert(&self, document: KnowledgeDocument) -> Result<usize, IndexError> {
        self.upsert_many(vec![document])
    }

    /// Insert or replace several documents, bumping the version once.
    pub fn upsert_many(&self, documents: Vec<KnowledgeDocument>) -> Result<usize, IndexError> {
        let mut prepared = Vec::new();
        for doc in &documents {
            if doc.source_id.trim().is_empty() {
                return Err(IndexError::InvalidDocument {
                    source_id: doc.source_id.clone(),
                    reason: "source_id is empty".into(),
                });
            }
            let pieces = chunk_words(&doc.text, self.chunk_size, self.chunk_overlap);
            if pieces.is_empty() {
                return Err(IndexError::InvalidDocument {
                    source_id: doc.source_id.clone(),
                    reason: "document has no text".into(),
                });
            }
            let updated_at = doc.updated_at.unwrap_or_else(Utc::now);
            let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
            let embeddings = self.embedder.embed_batch(&refs);
            for (text, embedding) in pieces.iter().zip(embeddings) {
                if embedding.len() != self.embedder.dimensions() {
                    return Err(IndexError::DimensionMismatch {
                        expected: self.embedder.dimensions(),
                        actual: embedding.len(),
                    });
                }
                prepared.push(IndexedChunk {
                    source_id: doc.source_id.clone(),
                    text: text.clone(),
                    partition: doc.partition.clone(),
                    owner: doc.owner.clone(),
                    updated_at,
                    embedding,
                });
            }
        }

        let stored = prepared.len();
        {
            let mut chunks = self.chunks.write().map_err(|_| IndexError::Unreachable {
                message: "index lock poisoned".into(),
            })?;
            chunks.retain(|c| !documents.iter().any(|d| d.source_id == c.source_id));
            chunks.extend(prepared);
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(documents = documents.len(), chunks = stored, version, "Knowledge index updated");
        Ok(stored)
    }

    /// Remove every chunk of a document. Returns whether anything was removed.
    pub fn remove(&self, source_id: &str) -> Result<bool, IndexError> {
        let removed = {
            let mut chunks = self.chunks.write().map_err(|_| IndexError::Unreachable {
                message: "index lock poisoned".into(),
            })?;
            let before = chunks.len();
            chunks.retain(|c| c.source_id != source_id);
            chunks.len() != before
        };
        if removed {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    /// Load documents from a JSON array file.
    pub fn load_json_file(&self, path: &Path) -> Result<usize, MedRouteError> {
        let raw = std::fs::read_to_string(path)?;
        let documents: Vec<KnowledgeDocument> = serde_json::from_str(&raw)?;
        let count = documents.len();
        let chunks = self.upsert_many(documents)?;
        info!(
            path = %path.display(),
            documents = count,
            chunks,
            "Loaded knowledge file"
        );
        Ok(count)
    }
}

#[async_trait]
impl KnowledgeIndex for InMemoryKnowledgeIndex {
    async fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        top_k: usize,
    ) -> Result<Vec<IndexHit>, IndexError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(IndexError::Unreachable {
                message: "in-memory index marked unavailable".into(),
            });
        }
        if embedding.len() != self.embedder.dimensions() {
            return Err(IndexError::DimensionMismatch {
                expected: self.embedder.dimensions(),
                actual: embedding.len(),
            });
        }

        let chunks = self.chunks.read().map_err(|_| IndexError::Unreachable {
            message: "index lock poisoned".into(),
        })?;
        let mut hits: Vec<IndexHit> = chunks
            .iter()
            .filter(|c| match &filter.partition {
                Some(p) => c.partition.as_deref() == Some(p.as_str()),
                None => true,
            })
            .filter(|c| match &filter.owner {
                Some(o) => c.owner.as_deref() == Some(o.as_str()),
                None => true,
            })
            .map(|c| IndexHit {
                source_id: c.source_id.clone(),
                text: c.text.clone(),
                partition: c.partition.clone(),
                updated_at: c.updated_at,
                similarity: cosine_similarity(embedding, &c.embedding),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;

    fn index() -> InMemoryKnowledgeIndex {
        InMemoryKnowledgeIndex::new(Arc::new(LocalEmbedder::new(128)))
    }

    #[test]
    fn test_chunk_words_short_text() {
        assert_eq!(chunk_words("one two three", 500, 50), vec!["one two three"]);
        assert!(chunk_words("   ", 500, 50).is_empty());
    }

    #[test]
    fn test_chunk_words_overlap() {
        let text = (0..10).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let chunks = chunk_words(&text, 4, 1);
        assert_eq!(chunks, vec!["0 1 2 3", "3 4 5 6", "6 7 8 9"]);
    }

    #[test]
    fn test_upsert_bumps_version() {
        let idx = index();
        let v0 = idx.version();
        idx.upsert(KnowledgeDocument::new("a", "aspirin thins blood")).unwrap();
        assert_eq!(idx.version(), v0 + 1);
        idx.upsert(KnowledgeDocument::new("a", "aspirin relieves pain")).unwrap();
        assert_eq!(idx.version(), v0 + 2);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_upsert_rejects_empty_document() {
        let idx = index();
        let err = idx.upsert(KnowledgeDocument::new("empty", "  ")).unwrap_err();
        assert!(matches!(err, IndexError::InvalidDocument { .. }));
    }

    #[test]
    fn test_remove_document() {
        let idx = index();
        idx.upsert(KnowledgeDocument::new("a", "fever")).unwrap();
        let v = idx.version();
        assert!(idx.remove("a").unwrap());
        assert!(!idx.remove("a").unwrap());
        assert_eq!(idx.version(), v + 1);
        assert!(idx.is_empty());
    }

    #[tokio::test]
    async fn test_search_filters_partition_and_owner() {
        let idx = index();
        idx.upsert_many(vec![
            KnowledgeDocument::new("kb-1", "metformin dosage").in_partition("drug_database"),
            KnowledgeDocument::new("doc-1", "metformin prescription")
                .in_partition("user_documents")
                .owned_by("alice"),
            KnowledgeDocument::new("doc-2", "metformin prescription")
                .in_partition("user_documents")
                .owned_by("bob"),
        ])
        .unwrap();

        let q = idx.embedder().embed("metformin");
        let hits = idx
            .search(&q, &SearchFilter::partition("user_documents").with_owner("alice"), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_id, "doc-1");

        let hits = idx
            .search(&q, &SearchFilter::partition("drug_database"), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_id, "kb-1");
    }

    #[tokio::test]
    async fn test_search_tie_break_newer_then_source_id() {
        let idx = index();
        let old = Utc::now() - chrono::Duration::days(30);
        let new = Utc::now();
        idx.upsert_many(vec![
            KnowledgeDocument::new("b", "same text").updated_at(old),
            KnowledgeDocument::new("c", "same text").updated_at(new),
            KnowledgeDocument::new("a", "same text").updated_at(old),
        ])
        .unwrap();
        let q = idx.embedder().embed("same text");
        let hits = idx.search(&q, &SearchFilter::default(), 5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.source_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_search_unavailable() {
        let idx = index();
        idx.set_available(false);
        let q = idx.embedder().embed("x");
        let err = idx.search(&q, &SearchFilter::default(), 5).await.unwrap_err();
        assert!(matches!(err, IndexError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_search_dimension_mismatch() {
        let idx = index();
        let err = idx
            .search(&[1.0, 0.0, 0.0], &SearchFilter::default(), 5)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                expected: 128,
                actual: 3
            }
        );
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(
            &path,
            r#"[
                {"source_id": "kb-1", "text": "Paracetamol reduces fever.", "partition": "drug_database"},
                {"source_id": "kb-2", "text": "Hydration matters.", "partition": "medical_knowledge",
                 "updated_at": "2024-05-01T00:00:00Z"}
            ]"#,
        )
        .unwrap();
        let idx = index();
        assert_eq!(idx.load_json_file(&path).unwrap(), 2);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_load_json_file_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = index().load_json_file(&path).unwrap_err();
        assert!(matches!(err, MedRouteError::Serialization(_)));
    }
}
