//! The answer pipeline: the single inbound operation.
//!
//! ```text
//! query -> pre-check -> history -> classify -> cache lookup
//!       -> dispatch + merge -> post-check -> cache write -> outcome
//! ```
//!
//! Escalations, refusals and system faults are distinct outcomes. Internal
//! error detail is logged, never returned.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::agents::AgentRegistry;
use crate::cache::{ResponseCache, fingerprint_scoped};
use crate::config::MedRouteConfig;
use crate::conversation::ConversationStore;
use crate::embeddings::Embedder;
use crate::error::{ConfigError, PipelineError, RETRY_LATER_MESSAGE};
use crate::index::KnowledgeIndex;
use crate::intent::{IntentClassifier, KeywordIntentClassifier};
use crate::orchestrator::Orchestrator;
use crate::retriever::Retriever;
use crate::safety::{QueryLifecycle, QueryStage, SafetyFilter};
use crate::types::{CapabilityTag, ErrorKind, ErrorResponse, Message, PipelineOutcome, Query};

/// Per-outcome counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub queries: u64,
    pub delivered: u64,
    pub cache_hits: u64,
    pub escalations: u64,
    pub refusals: u64,
    pub no_capability: u64,
    pub failures: u64,
}

/// Parts the pipeline is assembled from.
pub struct PipelineComponents {
    pub safety: SafetyFilter,
    pub classifier: Arc<dyn IntentClassifier>,
    pub orchestrator: Orchestrator,
    pub cache: ResponseCache,
    pub conversations: Arc<dyn ConversationStore>,
    /// Messages fetched once per query and shared by classifier and agents.
    pub history_window: usize,
}

struct PipelineInner {
    safety: SafetyFilter,
    classifier: Arc<dyn IntentClassifier>,
    orchestrator: Orchestrator,
    cache: ResponseCache,
    conversations: Arc<dyn ConversationStore>,
    history_window: usize,
    stats: Mutex<PipelineStats>,
}

/// Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct AnswerPipeline {
    inner: Arc<PipelineInner>,
}

impl AnswerPipeline {
    pub fn new(components: PipelineComponents) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                safety: components.safety,
                classifier: components.classifier,
                orchestrator: components.orchestrator,
                cache: components.cache,
                conversations: components.conversations,
                history_window: components.history_window,
                stats: Mutex::new(PipelineStats::default()),
            }),
        }
    }

    /// Assemble a pipeline with the keyword classifier from configuration.
    pub fn from_config(
        config: &MedRouteConfig,
        registry: AgentRegistry,
        index: Arc<dyn KnowledgeIndex>,
        embedder: Arc<dyn Embedder>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let retriever = Arc::new(Retriever::new(index, embedder, config.retrieval.clone()));
        Ok(Self::new(PipelineComponents {
            safety: SafetyFilter::new(&config.safety)?,
            classifier: Arc::new(KeywordIntentClassifier::new(config.intent.clone())),
            orchestrator: Orchestrator::new(registry, retriever, config.orchestrator.clone()),
            cache: ResponseCache::new(config.cache.clone()),
            conversations,
            history_window: config.orchestrator.history_window,
        }))
    }

    /// Answer one query.
    ///
    /// The work runs in its own task, so dropping the returned future does
    /// not cancel in-flight agents, the post-check or the cache write.
    pub async fn answer(&self, query: Query) -> PipelineOutcome {
        let inner = Arc::clone(&self.inner);
        let query_id = query.id;
        match tokio::spawn(async move { inner.process(query).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(query_id = %query_id, error = %e, "Pipeline task aborted");
                PipelineOutcome::Failed(ErrorResponse {
                    kind: ErrorKind::Internal,
                    message: RETRY_LATER_MESSAGE.to_string(),
                })
            }
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub fn safety(&self) -> &SafetyFilter {
        &self.inner.safety
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub fn classifier_name(&self) -> &str {
        self.inner.classifier.name()
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Drop cache entries built against an older index version.
    pub fn purge_stale_cache(&self) -> usize {
        let version = self.inner.orchestrator.retriever().index_version();
        self.inner.cache.purge_stale(version)
    }
}

/// Capabilities whose answers depend on the asking user's own data.
fn is_personal(tag: CapabilityTag) -> bool {
    matches!(tag, CapabilityTag::Document | CapabilityTag::Image)
}

fn error_outcome(err: &PipelineError) -> PipelineOutcome {
    let kind = match err {
        PipelineError::NoCapabilityMatch => ErrorKind::NoCapabilityMatch,
        PipelineError::AllAgentsUnavailable { .. } => ErrorKind::AllAgentsUnavailable,
        _ => ErrorKind::Internal,
    };
    PipelineOutcome::Failed(ErrorResponse {
        kind,
        message: err.user_message().to_string(),
    })
}

impl PipelineInner {
    async fn process(&self, query: Query) -> PipelineOutcome {
        let mut lifecycle = QueryLifecycle::new(query.id);
        let outcome = match self.run(&query, &mut lifecycle).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(query_id = %query.id, error = %e, "Pipeline state error");
                PipelineOutcome::Failed(ErrorResponse {
                    kind: ErrorKind::Internal,
                    message: RETRY_LATER_MESSAGE.to_string(),
                })
            }
        };

        self.record(&outcome);
        self.conversations
            .append(Message::user(&query.conversation_id, &query.text))
            .await;
        self.conversations
            .append(Message::assistant(&query.conversation_id, outcome.text()))
            .await;

        debug!(
            query_id = %query.id,
            path = ?lifecycle.path(),
            "Query finished"
        );
        outcome
    }

    async fn run(
        &self,
        query: &Query,
        lifecycle: &mut QueryLifecycle,
    ) -> Result<PipelineOutcome, PipelineError> {
        let pre = self.safety.pre_check(query);
        lifecycle.advance(QueryStage::PreChecked)?;
        if let Err(escalation) = pre {
            lifecycle.advance(QueryStage::Escalated)?;
            return Ok(PipelineOutcome::Escalated(escalation));
        }

        let history = self
            .conversations
            .recent_messages(&query.conversation_id, self.history_window)
            .await;
        let intent = self.classifier.classify(query, &history).await;
        if intent.is_empty() {
            lifecycle.advance(QueryStage::Failed)?;
            info!(query_id = %query.id, "No capability matched");
            return Ok(error_outcome(&PipelineError::NoCapabilityMatch));
        }
        lifecycle.advance(QueryStage::Routed)?;

        let tags = intent.tags();
        let version = self.orchestrator.retriever().index_version();
        let scope = tags.iter().any(|t| is_personal(*t)).then(|| {
            let attachment = query
                .attachment
                .as_ref()
                .map(|a| a.document_id.as_str())
                .unwrap_or("");
            format!("{}/{}", query.user_id, attachment)
        });
        let key = fingerprint_scoped(&query.text, &tags, version, scope.as_deref());

        if let Some(answer) = self.cache.get(&key) {
            lifecycle.advance(QueryStage::Delivered)?;
            self.safety.record_delivery(query.id, true);
            info!(query_id = %query.id, capabilities = ?tags, "Served from response cache");
            return Ok(PipelineOutcome::Delivered {
                answer,
                from_cache: true,
            });
        }

        let merged = match self.orchestrator.run(query, &intent, &history).await {
            Ok(merged) => merged,
            Err(e) => {
                lifecycle.advance(QueryStage::Failed)?;
                warn!(query_id = %query.id, error = %e, "No answer assembled");
                return Ok(error_outcome(&e));
            }
        };
        lifecycle.advance(QueryStage::Merged)?;

        let checked = self.safety.post_check(query, merged);
        lifecycle.advance(QueryStage::PostChecked)?;
        let answer = match checked {
            Ok(answer) => answer,
            Err(refusal) => {
                lifecycle.advance(QueryStage::Refused)?;
                return Ok(PipelineOutcome::Refused(refusal));
            }
        };
        lifecycle.advance(QueryStage::Delivered)?;
        self.safety.record_delivery(query.id, false);

        if answer.metadata.retrieval_degraded {
            debug!(query_id = %query.id, "Degraded answer not cached");
        } else {
            let built_against = answer.metadata.index_version;
            let key = if built_against == version {
                key
            } else {
                fingerprint_scoped(&query.text, &tags, built_against, scope.as_deref())
            };
            self.cache.put(key, answer.clone(), &tags, built_against);
        }

        info!(
            query_id = %query.id,
            capabilities = ?answer.capabilities(),
            citations = answer.citations.len(),
            "Answer delivered"
        );
        Ok(PipelineOutcome::Delivered {
            answer,
            from_cache: false,
        })
    }

    fn record(&self, outcome: &PipelineOutcome) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        stats.queries += 1;
        match outcome {
            PipelineOutcome::Delivered { from_cache, .. } => {
                stats.delivered += 1;
                if *from_cache {
                    stats.cache_hits += 1;
                }
            }
            PipelineOutcome::Escalated(_) => stats.escalations += 1,
            PipelineOutcome::Refused(_) => stats.refusals += 1,
            PipelineOutcome::Failed(e) if e.kind == ErrorKind::NoCapabilityMatch => {
                stats.no_capability += 1
            }
            PipelineOutcome::Failed(_) => stats.failures += 1,
        }
    }
}
