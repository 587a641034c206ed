//! Context retrieval over the knowledge index.
//!
//! Embeds the query, searches the partition belonging to a capability, drops
//! hits below the similarity threshold, and orders the survivors
//! deterministically (similarity, then recency, then source id).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::embeddings::Embedder;
use crate::error::{IndexError, PipelineError};
use crate::index::{KnowledgeIndex, SearchFilter};
use crate::types::{CapabilityTag, Query, RetrievedChunk};

/// Knowledge partition searched by each capability. `None` means the
/// capability runs without retrieved context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drug_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            qa: Some("medical_knowledge".into()),
            drug_info: Some("drug_database".into()),
            document: Some("user_documents".into()),
            image: None,
        }
    }
}

impl PartitionConfig {
    pub fn for_capability(&self, tag: CapabilityTag) -> Option<&str> {
        match tag {
            CapabilityTag::Qa => self.qa.as_deref(),
            CapabilityTag::DrugInfo => self.drug_info.as_deref(),
            CapabilityTag::Document => self.document.as_deref(),
            CapabilityTag::Image => self.image.as_deref(),
        }
    }
}

/// Retriever configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    /// Maximum chunks returned per capability.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum cosine similarity for a chunk to count as grounding.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Number of candidates requested from the index before thresholding.
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,
    /// Deadline for one index search.
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
    /// Character budget for context rendered into a model prompt.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default)]
    pub partitions: PartitionConfig,
    /// Partitions whose chunks are only visible to their owner.
    #[serde(default = "default_owner_scoped")]
    pub owner_scoped_partitions: Vec<String>,
}

fn default_top_k() -> usize {
    5
}
fn default_min_similarity() -> f32 {
    0.7
}
fn default_candidate_pool() -> usize {
    20
}
fn default_retrieval_timeout_ms() -> u64 {
    2000
}
fn default_max_context_chars() -> usize {
    3000
}
fn default_owner_scoped() -> Vec<String> {
    vec!["user_documents".into()]
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            candidate_pool: default_candidate_pool(),
            timeout_ms: default_retrieval_timeout_ms(),
            max_context_chars: default_max_context_chars(),
            partitions: PartitionConfig::default(),
            owner_scoped_partitions: default_owner_scoped(),
        }
    }
}

/// Embeds queries and searches the knowledge index.
pub struct Retriever {
    index: Arc<dyn KnowledgeIndex>,
    embedder: Arc<dyn Embedder>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn KnowledgeIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// Current version of the underlying index.
    pub fn index_version(&self) -> u64 {
        self.index.version()
    }

    /// Search filter for `tag` on behalf of `query`'s user, or `None` when
    /// the capability has no partition.
    pub fn filter_for(&self, query: &Query, tag: CapabilityTag) -> Option<SearchFilter> {
        let partition = self.config.partitions.for_capability(tag)?;
        let mut filter = SearchFilter::partition(partition);
        if self
            .config
            .owner_scoped_partitions
            .iter()
            .any(|p| p == partition)
        {
            filter = filter.with_owner(query.user_id.clone());
        }
        Some(filter)
    }

    /// Retrieve grounding context for one capability of a query.
    pub async fn retrieve_for(
        &self,
        query: &Query,
        tag: CapabilityTag,
    ) -> Result<Vec<RetrievedChunk>, PipelineError> {
        match self.filter_for(query, tag) {
            Some(filter) => self.retrieve(&query.text, &filter).await,
            None => Ok(Vec::new()),
        }
    }

    /// Retrieve chunks similar to `text` under `filter`.
    pub async fn retrieve(
        &self,
        text: &str,
        filter: &SearchFilter,
    ) -> Result<Vec<RetrievedChunk>, PipelineError> {
        let embedding = self.embedder.embed(text);
        let pool = self.config.top_k.max(self.config.candidate_pool);
        let deadline = Duration::from_millis(self.config.timeout_ms);

        let hits = match tokio::time::timeout(
            deadline,
            self.index.search(&embedding, filter, pool),
        )
        .await
        {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                warn!(partition = ?filter.partition, error = %e, "Knowledge index search failed");
                return Err(unavailable(e));
            }
            Err(_) => {
                warn!(
                    partition = ?filter.partition,
                    timeout_ms = self.config.timeout_ms,
                    "Knowledge index search timed out"
                );
                return Err(PipelineError::RetrievalUnavailable {
                    message: format!("search exceeded {}ms", self.config.timeout_ms),
                });
            }
        };

        let mut chunks: Vec<RetrievedChunk> = hits
            .into_iter()
            .filter(|h| h.similarity >= self.config.min_similarity)
            .map(|h| RetrievedChunk {
                source_id: h.source_id,
                text: h.text,
                similarity: h.similarity,
                origin_category: h.partition,
                updated_at: h.updated_at,
            })
            .collect();

        chunks.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        chunks.truncate(self.config.top_k);

        debug!(
            partition = ?filter.partition,
            retrieved = chunks.len(),
            "Retrieved grounding context"
        );
        Ok(chunks)
    }
}

fn unavailable(e: IndexError) -> PipelineError {
    PipelineError::RetrievalUnavailable {
        message: e.to_string(),
    }
}

/// Context rendered for a model prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub text: String,
    /// Source ids of the chunks that made it into `text`, in order.
    pub sources_used: Vec<String>,
    pub truncated: bool,
}

/// Renders retrieved chunks as numbered sources within a character budget.
pub struct ContextAssembler {
    max_chars: usize,
}

impl ContextAssembler {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn assemble(&self, chunks: &[RetrievedChunk]) -> AssembledContext {
        let mut text = String::new();
        let mut sources_used = Vec::new();
        let mut truncated = false;

        for (i, chunk) in chunks.iter().enumerate() {
            let part = format!(
                "[Source {}] (Relevance: {:.2})\n{}",
                i + 1,
                chunk.similarity,
                chunk.text
            );
            let separator = if text.is_empty() { "" } else { "\n---\n" };
            if text.len() + separator.len() + part.len() > self.max_chars {
                truncated = true;
                break;
            }
            text.push_str(separator);
            text.push_str(&part);
            if !sources_used.contains(&chunk.source_id) {
                sources_used.push(chunk.source_id.clone());
            }
        }

        AssembledContext {
            text,
            sources_used,
            truncated,
        }
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(default_max_context_chars())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::index::{InMemoryKnowledgeIndex, KnowledgeDocument};
    use chrono::Utc;

    fn setup(min_similarity: f32) -> (Arc<InMemoryKnowledgeIndex>, Retriever) {
        let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(256));
        let index = Arc::new(InMemoryKnowledgeIndex::new(Arc::clone(&embedder)));
        let config = RetrieverConfig {
            min_similarity,
            ..Default::default()
        };
        let retriever = Retriever::new(index.clone(), embedder, config);
        (index, retriever)
    }

    fn chunk(id: &str, similarity: f32) -> RetrievedChunk {
        RetrievedChunk {
            source_id: id.into(),
            text: format!("text of {id}"),
            similarity,
            origin_category: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_retrieve_applies_threshold() {
        let (index, retriever) = setup(0.7);
        index
            .upsert_many(vec![
                KnowledgeDocument::new("hit", "metformin side effects").in_partition("drug_database"),
                KnowledgeDocument::new("miss", "knee surgery recovery").in_partition("drug_database"),
            ])
            .unwrap();
        let query = Query::new("metformin side effects", "u1", "c1");
        let chunks = retriever.retrieve_for(&query, CapabilityTag::DrugInfo).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source_id, "hit");
        assert_eq!(chunks[0].origin_category.as_deref(), Some("drug_database"));
    }

    #[tokio::test]
    async fn test_retrieve_caps_at_top_k() {
        let (index, retriever) = setup(0.0);
        let at = Utc::now();
        let docs = (0..8)
            .map(|i| {
                KnowledgeDocument::new(format!("d{i}"), "fever")
                    .in_partition("medical_knowledge")
                    .updated_at(at)
            })
            .collect();
        index.upsert_many(docs).unwrap();
        let query = Query::new("fever", "u1", "c1");
        let chunks = retriever.retrieve_for(&query, CapabilityTag::Qa).await.unwrap();
        assert_eq!(chunks.len(), 5);
        // Equal similarity and timestamp fall back to source id order.
        let ids: Vec<&str> = chunks.iter().map(|c| c.source_id.as_str()).collect();
        assert_eq!(ids, vec!["d0", "d1", "d2", "d3", "d4"]);
    }

    #[tokio::test]
    async fn test_document_partition_is_owner_scoped() {
        let (index, retriever) = setup(0.0);
        index
            .upsert_many(vec![
                KnowledgeDocument::new("mine", "blood report")
                    .in_partition("user_documents")
                    .owned_by("u1"),
                KnowledgeDocument::new("theirs", "blood report")
                    .in_partition("user_documents")
                    .owned_by("u2"),
            ])
            .unwrap();
        let query = Query::new("blood report", "u1", "c1");
        let chunks = retriever.retrieve_for(&query, CapabilityTag::Document).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source_id, "mine");
    }

    #[tokio::test]
    async fn test_image_has_no_partition() {
        let (_index, retriever) = setup(0.0);
        let query = Query::new("what is on this x-ray", "u1", "c1");
        assert!(retriever.filter_for(&query, CapabilityTag::Image).is_none());
        assert!(retriever.retrieve_for(&query, CapabilityTag::Image).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_index_is_retrieval_unavailable() {
        let (index, retriever) = setup(0.7);
        index.set_available(false);
        let query = Query::new("fever", "u1", "c1");
        let err = retriever.retrieve_for(&query, CapabilityTag::Qa).await.unwrap_err();
        assert!(matches!(err, PipelineError::RetrievalUnavailable { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_context_assembler_format() {
        let ctx = ContextAssembler::default().assemble(&[chunk("a", 0.91), chunk("b", 0.8)]);
        assert_eq!(
            ctx.text,
            "[Source 1] (Relevance: 0.91)\ntext of a\n---\n[Source 2] (Relevance: 0.80)\ntext of b"
        );
        assert_eq!(ctx.sources_used, vec!["a", "b"]);
        assert!(!ctx.truncated);
    }

    #[test]
    fn test_context_assembler_budget() {
        let ctx = ContextAssembler::new(40).assemble(&[chunk("a", 0.9), chunk("b", 0.8)]);
        assert_eq!(ctx.sources_used, vec!["a"]);
        assert!(ctx.truncated);
    }

    #[test]
    fn test_partition_defaults() {
        let p = PartitionConfig::default();
        assert_eq!(p.for_capability(CapabilityTag::Qa), Some("medical_knowledge"));
        assert_eq!(p.for_capability(CapabilityTag::Image), None);
    }
}
