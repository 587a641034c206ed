//! Orchestrator: concurrent capability dispatch and deterministic merge.
//!
//! For every capability in the intent one task is spawned that retrieves
//! grounding context from the capability's partition and then invokes the
//! capability's agent. Each task has its own deadline; the orchestrator
//! waits for all of them, then merges the survivors in priority order so the
//! result never depends on completion order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::agents::{AgentRegistry, AgentRequest, CapabilityAgent, extractive::split_sentences};
use crate::error::PipelineError;
use crate::intent::normalize_for_matching;
use crate::retriever::Retriever;
use crate::types::{
    AgentInvocation, AgentOutput, AnswerMetadata, AnswerSegment, CapabilityTag, Intent,
    InvocationStatus, MergedAnswer, Message, Query,
};

/// How segments are ordered when several capabilities answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Configured capability priority decides the order.
    #[default]
    Priority,
    /// Higher agent confidence first; priority breaks ties.
    Confidence,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deadline for one capability (retrieval plus agent call).
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    /// Merge order, highest priority first.
    #[serde(default = "default_priority")]
    pub priority: Vec<CapabilityTag>,
    /// Number of recent messages passed to classification and agents.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

fn default_agent_timeout_ms() -> u64 {
    3000
}
fn default_priority() -> Vec<CapabilityTag> {
    CapabilityTag::all().to_vec()
}
fn default_history_window() -> usize {
    6
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_timeout_ms: default_agent_timeout_ms(),
            priority: default_priority(),
            history_window: default_history_window(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

/// Dispatch statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStats {
    pub queries_routed: u64,
    pub dispatches: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub degraded_retrievals: u64,
    pub multi_capability_routes: u64,
    pub all_failed: u64,
    pub capability_hits: BTreeMap<CapabilityTag, u64>,
}

/// Invocations for one query plus retrieval status.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub invocations: Vec<AgentInvocation>,
    pub retrieval_degraded: bool,
    pub index_version: u64,
}

struct TaskResult {
    context_ids: Vec<String>,
    grounded: bool,
    degraded: bool,
    outcome: Result<AgentOutput, TaskFailure>,
    latency: Duration,
}

enum TaskFailure {
    TimedOut,
    Failed(String),
}

pub struct Orchestrator {
    registry: AgentRegistry,
    retriever: Arc<Retriever>,
    config: OrchestratorConfig,
    stats: Mutex<OrchestratorStats>,
}

impl Orchestrator {
    pub fn new(registry: AgentRegistry, retriever: Arc<Retriever>, config: OrchestratorConfig) -> Self {
        Self {
            registry,
            retriever,
            config,
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Dispatch and merge in one step.
    pub async fn run(
        &self,
        query: &Query,
        intent: &Intent,
        history: &[Message],
    ) -> Result<MergedAnswer, PipelineError> {
        if intent.is_empty() {
            return Err(PipelineError::NoCapabilityMatch);
        }
        let report = self.dispatch(query, intent, history).await;
        self.merge(&report)
    }

    /// Run every selected capability concurrently, each under its own deadline.
    pub async fn dispatch(&self, query: &Query, intent: &Intent, history: &[Message]) -> DispatchReport {
        let tags = intent.tags();
        let deadline = Duration::from_millis(self.config.agent_timeout_ms);
        let index_version = self.retriever.index_version();

        info!(
            query_id = %query.id,
            capabilities = ?tags,
            timeout_ms = self.config.agent_timeout_ms,
            "Dispatching capability agents"
        );

        let handles: Vec<_> = tags
            .iter()
            .map(|&tag| {
                let agent = self.registry.get(tag);
                let retriever = Arc::clone(&self.retriever);
                let query = query.clone();
                let history = history.to_vec();
                tokio::spawn(async move {
                    run_capability(tag, agent, retriever, query, history, deadline).await
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;

        let mut invocations = Vec::with_capacity(tags.len());
        let mut retrieval_degraded = false;
        for (&tag, joined) in tags.iter().zip(results) {
            let agent_id = self
                .registry
                .get(tag)
                .map(|a| a.id().to_string())
                .unwrap_or_else(|| format!("unregistered-{}", tag.as_str()));
            let mut invocation = AgentInvocation::pending(agent_id, tag);

            match joined {
                Ok(result) => {
                    retrieval_degraded |= result.degraded;
                    invocation.context_ids = result.context_ids;
                    invocation.grounded = result.grounded;
                    invocation.latency = result.latency;
                    match result.outcome {
                        Ok(output) => {
                            invocation.status = InvocationStatus::Succeeded;
                            invocation.output = Some(output);
                        }
                        Err(TaskFailure::TimedOut) => {
                            warn!(
                                query_id = %query.id,
                                agent = %invocation.agent_id,
                                timeout_ms = self.config.agent_timeout_ms,
                                "Agent timed out"
                            );
                            invocation.status = InvocationStatus::TimedOut;
                            invocation.error = Some(
                                PipelineError::AgentTimeout {
                                    agent: invocation.agent_id.clone(),
                                    timeout_ms: self.config.agent_timeout_ms,
                                }
                                .to_string(),
                            );
                        }
                        Err(TaskFailure::Failed(message)) => {
                            warn!(
                                query_id = %query.id,
                                agent = %invocation.agent_id,
                                error = %message,
                                "Agent failed"
                            );
                            invocation.status = InvocationStatus::Failed;
                            invocation.error = Some(message);
                        }
                    }
                }
                Err(e) => {
                    warn!(query_id = %query.id, agent = %invocation.agent_id, error = %e, "Agent task aborted");
                    invocation.status = InvocationStatus::Failed;
                    invocation.error = Some(format!("agent task aborted: {e}"));
                }
            }
            invocations.push(invocation);
        }

        self.record_dispatch(&invocations, retrieval_degraded);
        DispatchReport {
            invocations,
            retrieval_degraded,
            index_version,
        }
    }

    fn priority_of(&self, tag: CapabilityTag) -> usize {
        self.config
            .priority
            .iter()
            .position(|t| *t == tag)
            .unwrap_or(usize::MAX)
    }

    /// Deterministic merge of all succeeded invocations.
    ///
    /// A claim is a sentence. A sentence is dropped when its normalized form
    /// was already emitted, or when a higher-ranked segment citing one of the
    /// same source ids already made an overlapping claim (word overlap of at
    /// least `CLAIM_OVERLAP`). Citations keep their first occurrence in merge
    /// order.
    pub fn merge(&self, report: &DispatchReport) -> Result<MergedAnswer, PipelineError> {
        let mut succeeded: Vec<(&AgentInvocation, &AgentOutput)> = report
            .invocations
            .iter()
            .filter(|i| i.status == InvocationStatus::Succeeded)
            .filter_map(|i| i.output.as_ref().map(|o| (i, o)))
            .collect();

        if succeeded.is_empty() {
            if let Ok(mut stats) = self.stats.lock() {
                stats.all_failed += 1;
            }
            return Err(PipelineError::AllAgentsUnavailable {
                attempted: report.invocations.len(),
            });
        }

        succeeded.sort_by(|(a, oa), (b, ob)| {
            let by_priority = self
                .priority_of(a.capability)
                .cmp(&self.priority_of(b.capability))
                .then(a.capability.cmp(&b.capability));
            match self.config.conflict_policy {
                ConflictPolicy::Priority => by_priority,
                ConflictPolicy::Confidence => {
                    let ca = oa.confidence.unwrap_or(0.0);
                    let cb = ob.confidence.unwrap_or(0.0);
                    cb.total_cmp(&ca).then(by_priority)
                }
            }
        });

        let mut seen_claims: HashSet<String> = HashSet::new();
        let mut cited_claims: Vec<CitedClaim> = Vec::new();
        let mut duplicates = 0usize;
        let mut segments = Vec::new();
        let mut citations: Vec<String> = Vec::new();
        let mut contributing_agents = BTreeSet::new();
        let mut ungrounded = Vec::new();

        for (invocation, output) in &succeeded {
            let mut kept = Vec::new();
            let mut fresh_claims = Vec::new();
            for sentence in split_sentences(&output.text) {
                let claim = normalize_for_matching(&sentence).trim().to_string();
                if claim.is_empty() {
                    kept.push(sentence);
                    continue;
                }
                let words: BTreeSet<String> = claim.split_whitespace().map(str::to_string).collect();
                let restated = seen_claims.contains(&claim)
                    || cited_claims
                        .iter()
                        .any(|prior| prior.overlaps(&words, &output.citations));
                if restated {
                    duplicates += 1;
                    continue;
                }
                seen_claims.insert(claim);
                if !output.citations.is_empty() {
                    fresh_claims.push(CitedClaim {
                        words,
                        sources: output.citations.clone(),
                    });
                }
                kept.push(sentence);
            }
            cited_claims.extend(fresh_claims);

            for citation in &output.citations {
                if !citations.contains(citation) {
                    citations.push(citation.clone());
                }
            }
            contributing_agents.insert(invocation.agent_id.clone());
            if !invocation.grounded {
                ungrounded.push(invocation.capability);
            }
            if !kept.is_empty() {
                segments.push(AnswerSegment {
                    capability: invocation.capability,
                    agent_id: invocation.agent_id.clone(),
                    text: kept.join(" "),
                });
            }
        }

        let text = render_segments(&segments);
        let ids_with = |status: InvocationStatus| -> Vec<String> {
            report
                .invocations
                .iter()
                .filter(|i| i.status == status)
                .map(|i| i.agent_id.clone())
                .collect()
        };

        debug!(
            segments = segments.len(),
            citations = citations.len(),
            duplicates,
            "Merged agent outputs"
        );

        Ok(MergedAnswer {
            text,
            segments,
            citations,
            contributing_agents,
            metadata: AnswerMetadata {
                retrieval_degraded: report.retrieval_degraded,
                ungrounded,
                timed_out_agents: ids_with(InvocationStatus::TimedOut),
                failed_agents: ids_with(InvocationStatus::Failed),
                duplicate_claims_dropped: duplicates,
                rewritten_segments: 0,
                index_version: report.index_version,
            },
        })
    }

    fn record_dispatch(&self, invocations: &[AgentInvocation], degraded: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.queries_routed += 1;
            stats.dispatches += invocations.len() as u64;
            if invocations.len() > 1 {
                stats.multi_capability_routes += 1;
            }
            if degraded {
                stats.degraded_retrievals += 1;
            }
            for inv in invocations {
                *stats.capability_hits.entry(inv.capability).or_insert(0) += 1;
                match inv.status {
                    InvocationStatus::TimedOut => stats.timeouts += 1,
                    InvocationStatus::Failed => stats.failures += 1,
                    _ => {}
                }
            }
        }
    }
}

/// Share of words two sentences must have in common to count as the same claim.
const CLAIM_OVERLAP: f64 = 0.6;

/// A claim already emitted by a segment, with the sources that segment cited.
struct CitedClaim {
    words: BTreeSet<String>,
    sources: Vec<String>,
}

impl CitedClaim {
    fn overlaps(&self, words: &BTreeSet<String>, sources: &[String]) -> bool {
        if !sources.iter().any(|s| self.sources.contains(s)) {
            return false;
        }
        let shared = self.words.intersection(words).count();
        let total = self.words.union(words).count();
        total > 0 && shared as f64 / total as f64 >= CLAIM_OVERLAP
    }
}

/// Render segments under capability headings. A single segment is rendered bare.
pub fn render_segments(segments: &[AnswerSegment]) -> String {
    if segments.len() == 1 {
        return segments[0].text.clone();
    }
    segments
        .iter()
        .map(|s| format!("**{}**\n{}", s.capability.display_name(), s.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn run_capability(
    tag: CapabilityTag,
    agent: Option<Arc<dyn CapabilityAgent>>,
    retriever: Arc<Retriever>,
    query: Query,
    history: Vec<Message>,
    deadline: Duration,
) -> TaskResult {
    let started = Instant::now();
    let Some(agent) = agent else {
        return TaskResult {
            context_ids: Vec::new(),
            grounded: false,
            degraded: false,
            outcome: Err(TaskFailure::Failed(format!(
                "no agent registered for capability '{tag}'"
            ))),
            latency: Duration::ZERO,
        };
    };

    let (context, degraded) = match tokio::time::timeout(deadline, retriever.retrieve_for(&query, tag)).await {
        Ok(Ok(chunks)) => (chunks, false),
        Ok(Err(e)) => {
            warn!(capability = %tag, error = %e, "Retrieval degraded, agent runs ungrounded");
            (Vec::new(), true)
        }
        Err(_) => {
            warn!(capability = %tag, "Retrieval exceeded the agent deadline");
            (Vec::new(), true)
        }
    };

    let remaining = deadline.saturating_sub(started.elapsed());
    let request = AgentRequest {
        grounded: !degraded,
        timeout: remaining,
        context,
        history,
        query,
    };
    let context_ids = request.context_ids();
    let grounded = !degraded && !context_ids.is_empty();

    let outcome = match tokio::time::timeout(remaining, agent.invoke(request)).await {
        Ok(Ok(reply)) => Ok(AgentOutput::from(reply)),
        Ok(Err(e)) => Err(TaskFailure::Failed(e.to_string())),
        Err(_) => Err(TaskFailure::TimedOut),
    };

    TaskResult {
        context_ids,
        grounded,
        degraded,
        outcome,
        latency: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ScriptedAgent;
    use crate::embeddings::LocalEmbedder;
    use crate::index::InMemoryKnowledgeIndex;
    use crate::retriever::RetrieverConfig;
    use pretty_assertions::assert_eq;

    fn retriever() -> (Arc<InMemoryKnowledgeIndex>, Arc<Retriever>) {
        let embedder: Arc<dyn crate::embeddings::Embedder> = Arc::new(LocalEmbedder::new(64));
        let index = Arc::new(InMemoryKnowledgeIndex::new(Arc::clone(&embedder)));
        let retriever = Arc::new(Retriever::new(index.clone(), embedder, RetrieverConfig::default()));
        (index, retriever)
    }

    fn intent(tags: &[CapabilityTag]) -> Intent {
        let mut intent = Intent::default();
        for tag in tags {
            intent.confidence.insert(*tag, 0.5);
        }
        intent
    }

    fn orchestrator(agents: Vec<ScriptedAgent>, timeout_ms: u64) -> Orchestrator {
        let mut registry = AgentRegistry::new();
        for agent in agents {
            registry.register(Arc::new(agent));
        }
        Orchestrator::new(
            registry,
            retriever().1,
            OrchestratorConfig {
                agent_timeout_ms: timeout_ms,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_empty_intent_is_no_capability_match() {
        let orch = orchestrator(vec![], 100);
        let err = orch
            .run(&Query::new("hi", "u1", "c1"), &Intent::default(), &[])
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::NoCapabilityMatch);
    }

    #[tokio::test]
    async fn test_merge_order_independent_of_completion_order() {
        // DrugInfo finishes first, Qa last; Qa still merges first.
        let orch = orchestrator(
            vec![
                ScriptedAgent::new("qa", CapabilityTag::Qa, "Bananas are rich in potassium.")
                    .with_citations(&["kb-diet", "kb-shared"])
                    .with_delay(Duration::from_millis(60)),
                ScriptedAgent::new("drug", CapabilityTag::DrugInfo, "Metformin lowers blood sugar.")
                    .with_citations(&["kb-shared", "kb-drug"]),
            ],
            1000,
        );
        let q = Query::new("q", "u1", "c1");
        let answer = orch
            .run(&q, &intent(&[CapabilityTag::DrugInfo, CapabilityTag::Qa]), &[])
            .await
            .unwrap();
        assert_eq!(answer.capabilities(), vec![CapabilityTag::Qa, CapabilityTag::DrugInfo]);
        assert_eq!(answer.citations, vec!["kb-diet", "kb-shared", "kb-drug"]);
        assert_eq!(
            answer.text,
            "**General health information**\nBananas are rich in potassium.\n\n\
             **Medicine information**\nMetformin lowers blood sugar."
        );
    }

    #[tokio::test]
    async fn test_timeout_excludes_agent() {
        let orch = orchestrator(
            vec![
                ScriptedAgent::new("qa", CapabilityTag::Qa, "Fast answer.").with_citations(&["a"]),
                ScriptedAgent::new("drug", CapabilityTag::DrugInfo, "Slow answer.")
                    .with_citations(&["b"])
                    .with_delay(Duration::from_millis(500)),
            ],
            50,
        );
        let q = Query::new("q", "u1", "c1");
        let started = Instant::now();
        let report = orch
            .dispatch(&q, &intent(&[CapabilityTag::Qa, CapabilityTag::DrugInfo]), &[])
            .await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(report.invocations[1].status, InvocationStatus::TimedOut);

        let answer = orch.merge(&report).unwrap();
        assert_eq!(answer.text, "Fast answer.");
        assert_eq!(answer.citations, vec!["a"]);
        assert_eq!(answer.metadata.timed_out_agents, vec!["drug"]);
        assert_eq!(orch.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_all_failed() {
        let orch = orchestrator(
            vec![ScriptedAgent::new("qa", CapabilityTag::Qa, "x").failing()],
            100,
        );
        let err = orch
            .run(&Query::new("q", "u1", "c1"), &intent(&[CapabilityTag::Qa]), &[])
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::AllAgentsUnavailable { attempted: 1 });
    }

    #[tokio::test]
    async fn test_unregistered_capability_fails_softly() {
        let orch = orchestrator(vec![ScriptedAgent::new("qa", CapabilityTag::Qa, "Only qa.")], 100);
        let answer = orch
            .run(
                &Query::new("q", "u1", "c1"),
                &intent(&[CapabilityTag::Qa, CapabilityTag::Image]),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(answer.text, "Only qa.");
        assert_eq!(answer.metadata.failed_agents, vec!["unregistered-image"]);
    }

    #[tokio::test]
    async fn test_duplicate_claims_dropped_from_lower_priority() {
        let orch = orchestrator(
            vec![
                ScriptedAgent::new("qa", CapabilityTag::Qa, "Take it with food. Stay hydrated."),
                ScriptedAgent::new("drug", CapabilityTag::DrugInfo, "take it with FOOD! It may cause nausea."),
            ],
            500,
        );
        let answer = orch
            .run(
                &Query::new("q", "u1", "c1"),
                &intent(&[CapabilityTag::Qa, CapabilityTag::DrugInfo]),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(answer.segments[1].text, "It may cause nausea.");
        assert_eq!(answer.metadata.duplicate_claims_dropped, 1);
    }

    #[tokio::test]
    async fn test_restated_claim_from_same_source_dropped() {
        let orch = orchestrator(
            vec![
                ScriptedAgent::new("qa", CapabilityTag::Qa, "Metformin lowers blood sugar in type 2 diabetes.")
                    .with_citations(&["kb-met"]),
                ScriptedAgent::new(
                    "drug",
                    CapabilityTag::DrugInfo,
                    "In type 2 diabetes, metformin lowers the blood sugar. Take it with meals.",
                )
                .with_citations(&["kb-met", "kb-label"]),
                ScriptedAgent::new(
                    "doc",
                    CapabilityTag::Document,
                    "Metformin lowers the blood sugar in type 2 diabetes.",
                )
                .with_citations(&["doc-1"]),
            ],
            500,
        );
        let answer = orch
            .run(
                &Query::new("q", "u1", "c1"),
                &intent(&[CapabilityTag::Qa, CapabilityTag::DrugInfo, CapabilityTag::Document]),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(answer.segments.len(), 3);
        assert_eq!(answer.segments[1].text, "Take it with meals.");
        // Same wording from a different source is kept.
        assert_eq!(
            answer.segments[2].text,
            "Metformin lowers the blood sugar in type 2 diabetes."
        );
        assert_eq!(answer.metadata.duplicate_claims_dropped, 1);
        assert_eq!(answer.citations, vec!["kb-met", "kb-label", "doc-1"]);
    }

    struct SlowIndex;

    #[async_trait::async_trait]
    impl crate::index::KnowledgeIndex for SlowIndex {
        async fn search(
            &self,
            _embedding: &[f32],
            _filter: &crate::index::SearchFilter,
            _top_k: usize,
        ) -> Result<Vec<crate::index::IndexHit>, crate::error::IndexError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Vec::new())
        }

        fn version(&self) -> u64 {
            1
        }
    }

    #[tokio::test]
    async fn test_agent_timeout_excludes_retrieval_time() {
        let retriever = Arc::new(Retriever::new(
            Arc::new(SlowIndex),
            Arc::new(LocalEmbedder::new(64)),
            RetrieverConfig::default(),
        ));
        let agent = Arc::new(ScriptedAgent::new("qa", CapabilityTag::Qa, "ok"));
        let orch = Orchestrator::new(
            AgentRegistry::new().with(agent.clone()),
            retriever,
            OrchestratorConfig {
                agent_timeout_ms: 1000,
                ..Default::default()
            },
        );
        orch.run(&Query::new("fever", "u1", "c1"), &intent(&[CapabilityTag::Qa]), &[])
            .await
            .unwrap();
        let timeout = agent.last_request().unwrap().timeout;
        assert!(timeout <= Duration::from_millis(900), "{timeout:?}");
        assert!(timeout > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_confidence_policy_reorders() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(
            ScriptedAgent::new("qa", CapabilityTag::Qa, "General.").with_confidence(0.4),
        ));
        registry.register(Arc::new(
            ScriptedAgent::new("drug", CapabilityTag::DrugInfo, "Specific.").with_confidence(0.9),
        ));
        let orch = Orchestrator::new(
            registry,
            retriever().1,
            OrchestratorConfig {
                conflict_policy: ConflictPolicy::Confidence,
                ..Default::default()
            },
        );
        let answer = orch
            .run(
                &Query::new("q", "u1", "c1"),
                &intent(&[CapabilityTag::Qa, CapabilityTag::DrugInfo]),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(answer.capabilities(), vec![CapabilityTag::DrugInfo, CapabilityTag::Qa]);
    }

    #[tokio::test]
    async fn test_degraded_retrieval_runs_ungrounded() {
        let (index, retriever) = retriever();
        index.set_available(false);
        let agent = Arc::new(ScriptedAgent::new("qa", CapabilityTag::Qa, "General info."));
        let registry = AgentRegistry::new().with(agent.clone());
        let orch = Orchestrator::new(registry, retriever, OrchestratorConfig::default());
        let answer = orch
            .run(&Query::new("fever", "u1", "c1"), &intent(&[CapabilityTag::Qa]), &[])
            .await
            .unwrap();
        assert!(answer.metadata.retrieval_degraded);
        assert_eq!(answer.metadata.ungrounded, vec![CapabilityTag::Qa]);
        assert!(!agent.last_request().unwrap().grounded);
    }

    #[tokio::test]
    async fn test_history_passed_to_agents() {
        let agent = Arc::new(ScriptedAgent::new("qa", CapabilityTag::Qa, "ok"));
        let orch = Orchestrator::new(
            AgentRegistry::new().with(agent.clone()),
            retriever().1,
            OrchestratorConfig::default(),
        );
        let history = vec![Message::user("c1", "earlier question")];
        orch.run(&Query::new("q", "u1", "c1"), &intent(&[CapabilityTag::Qa]), &history)
            .await
            .unwrap();
        assert_eq!(agent.last_request().unwrap().history, history);
    }
}
