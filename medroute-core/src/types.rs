//! Core data types shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Closed set of capabilities a query can be routed to.
///
/// The declaration order is the default merge priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTag {
    /// General health questions: conditions, symptoms, diet, lifestyle.
    Qa,
    /// Medicine information: uses, dosage, side effects, interactions.
    DrugInfo,
    /// Summaries of the user's own medical documents and prescriptions.
    Document,
    /// Analysis of an attached medical image.
    Image,
}

impl CapabilityTag {
    /// All capability tags in default priority order.
    pub fn all() -> &'static [CapabilityTag] {
        &[
            CapabilityTag::Qa,
            CapabilityTag::DrugInfo,
            CapabilityTag::Document,
            CapabilityTag::Image,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityTag::Qa => "qa",
            CapabilityTag::DrugInfo => "drug_info",
            CapabilityTag::Document => "document",
            CapabilityTag::Image => "image",
        }
    }

    /// Heading used when rendering this capability's segment of an answer.
    pub fn display_name(&self) -> &'static str {
        match self {
            CapabilityTag::Qa => "General health information",
            CapabilityTag::DrugInfo => "Medicine information",
            CapabilityTag::Document => "From your documents",
            CapabilityTag::Image => "Image analysis",
        }
    }
}

impl fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "qa" => Ok(CapabilityTag::Qa),
            "drug_info" | "drug" => Ok(CapabilityTag::DrugInfo),
            "document" | "doc" => Ok(CapabilityTag::Document),
            "image" => Ok(CapabilityTag::Image),
            other => Err(format!("unknown capability tag: {other}")),
        }
    }
}

/// Kind of file attached to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Document,
    Image,
}

/// Reference to a previously uploaded document or image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub document_id: String,
    pub kind: AttachmentKind,
}

/// An inbound user question. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub text: String,
    pub user_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    pub submitted_at: DateTime<Utc>,
}

impl Query {
    pub fn new(
        text: impl Into<String>,
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            attachment: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_attachment(mut self, document_id: impl Into<String>, kind: AttachmentKind) -> Self {
        self.attachment = Some(AttachmentRef {
            document_id: document_id.into(),
            kind,
        });
        self
    }
}

/// Transient routing decision: which capabilities fire, with confidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub confidence: BTreeMap<CapabilityTag, f64>,
    /// Whether the tags came from the conversation window rather than the query text.
    #[serde(default)]
    pub from_history: bool,
}

impl Intent {
    pub fn is_empty(&self) -> bool {
        self.confidence.is_empty()
    }

    /// Tags in sorted (default priority) order.
    pub fn tags(&self) -> Vec<CapabilityTag> {
        self.confidence.keys().copied().collect()
    }

    pub fn contains(&self, tag: CapabilityTag) -> bool {
        self.confidence.contains_key(&tag)
    }

    pub fn confidence_of(&self, tag: CapabilityTag) -> f64 {
        self.confidence.get(&tag).copied().unwrap_or(0.0)
    }
}

/// A chunk of grounding context returned by the retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub source_id: String,
    pub text: String,
    pub similarity: f32,
    /// Knowledge partition the chunk came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_category: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of one agent dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

/// Record of one capability agent dispatched for a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub agent_id: String,
    pub capability: CapabilityTag,
    pub context_ids: Vec<String>,
    pub grounded: bool,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<AgentOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
}

impl AgentInvocation {
    pub fn pending(agent_id: impl Into<String>, capability: CapabilityTag) -> Self {
        Self {
            agent_id: agent_id.into(),
            capability,
            context_ids: Vec::new(),
            grounded: false,
            status: InvocationStatus::Pending,
            output: None,
            error: None,
            latency: Duration::ZERO,
        }
    }
}

/// Successful output of an agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub text: String,
    pub citations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// One capability's contribution to a merged answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSegment {
    pub capability: CapabilityTag,
    pub agent_id: String,
    pub text: String,
}

/// Diagnostic metadata carried alongside a merged answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerMetadata {
    /// Retrieval failed for at least one capability; those agents ran ungrounded.
    pub retrieval_degraded: bool,
    #[serde(default)]
    pub ungrounded: Vec<CapabilityTag>,
    #[serde(default)]
    pub timed_out_agents: Vec<String>,
    #[serde(default)]
    pub failed_agents: Vec<String>,
    /// Claims dropped because a higher-priority segment already stated them.
    #[serde(default)]
    pub duplicate_claims_dropped: usize,
    /// Segments rewritten by the safety post-check.
    #[serde(default)]
    pub rewritten_segments: usize,
    pub index_version: u64,
}

/// The single answer assembled from all successful agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedAnswer {
    pub text: String,
    pub segments: Vec<AnswerSegment>,
    pub citations: Vec<String>,
    pub contributing_agents: BTreeSet<String>,
    pub metadata: AnswerMetadata,
}

impl MergedAnswer {
    pub fn capabilities(&self) -> Vec<CapabilityTag> {
        self.segments.iter().map(|s| s.capability).collect()
    }
}

/// Role of a conversation message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A conversation message. Appended, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(conversation_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn user(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::User, content)
    }

    pub fn assistant(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::Assistant, content)
    }
}

/// Fixed response returned when the pre-check escalates a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationResponse {
    pub text: String,
    /// Escalation terms that matched.
    pub matched: Vec<String>,
}

/// Fixed response returned when the post-check refuses an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefusalResponse {
    pub text: String,
    pub rule: String,
}

/// Generic error response. `message` never carries internal detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoCapabilityMatch,
    AllAgentsUnavailable,
    Internal,
}

/// Result of `answer(query)` from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Delivered {
        answer: MergedAnswer,
        from_cache: bool,
    },
    Escalated(EscalationResponse),
    Refused(RefusalResponse),
    Failed(ErrorResponse),
}

impl PipelineOutcome {
    /// The text to show the user, whatever the outcome.
    pub fn text(&self) -> &str {
        match self {
            PipelineOutcome::Delivered { answer, .. } => &answer.text,
            PipelineOutcome::Escalated(e) => &e.text,
            PipelineOutcome::Refused(r) => &r.text,
            PipelineOutcome::Failed(e) => &e.message,
        }
    }

    pub fn answer(&self) -> Option<&MergedAnswer> {
        match self {
            PipelineOutcome::Delivered { answer, .. } => Some(answer),
            _ => None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, PipelineOutcome::Delivered { .. })
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_tag_order_is_default_priority() {
        let mut tags = vec![
            CapabilityTag::Image,
            CapabilityTag::Qa,
            CapabilityTag::Document,
            CapabilityTag::DrugInfo,
        ];
        tags.sort();
        assert_eq!(tags, CapabilityTag::all());
    }

    #[test]
    fn test_capability_tag_serde_snake_case() {
        let json = serde_json::to_string(&CapabilityTag::DrugInfo).unwrap();
        assert_eq!(json, "\"drug_info\"");
        let tag: CapabilityTag = serde_json::from_str("\"qa\"").unwrap();
        assert_eq!(tag, CapabilityTag::Qa);
    }

    #[test]
    fn test_capability_tag_from_str() {
        assert_eq!("drug_info".parse::<CapabilityTag>(), Ok(CapabilityTag::DrugInfo));
        assert_eq!(" Image ".parse::<CapabilityTag>(), Ok(CapabilityTag::Image));
        assert!("surgery".parse::<CapabilityTag>().is_err());
    }

    #[test]
    fn test_intent_tags_sorted() {
        let mut intent = Intent::default();
        intent.confidence.insert(CapabilityTag::DrugInfo, 0.5);
        intent.confidence.insert(CapabilityTag::Qa, 0.75);
        assert_eq!(intent.tags(), vec![CapabilityTag::Qa, CapabilityTag::DrugInfo]);
        assert!(intent.contains(CapabilityTag::Qa));
        assert_eq!(intent.confidence_of(CapabilityTag::Image), 0.0);
    }

    #[test]
    fn test_query_with_attachment() {
        let q = Query::new("summarize this", "u1", "c1")
            .with_attachment("doc-9", AttachmentKind::Document);
        assert_eq!(q.attachment.as_ref().unwrap().document_id, "doc-9");
    }

    #[test]
    fn test_outcome_serialization_tagged() {
        let outcome = PipelineOutcome::Failed(ErrorResponse {
            kind: ErrorKind::Internal,
            message: "retry".into(),
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(outcome.text(), "retry");
        assert!(!outcome.is_delivered());
    }

    #[test]
    fn test_invocation_latency_serializes_as_millis() {
        let mut inv = AgentInvocation::pending("qa-agent", CapabilityTag::Qa);
        inv.latency = Duration::from_millis(1250);
        let json = serde_json::to_value(&inv).unwrap();
        assert_eq!(json["latency"], 1250);
        assert_eq!(json["status"], "pending");
    }
}
