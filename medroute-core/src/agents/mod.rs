//! Capability agents: one specialist per capability tag.
//!
//! Every agent sits behind [`CapabilityAgent`]. The orchestrator never knows
//! whether an agent calls a hosted model, extracts from retrieved context, or
//! replays a script.

pub mod extractive;
pub mod llm;
pub mod prompts;
pub mod scripted;

pub use extractive::ExtractiveAgent;
pub use llm::{ChatMessage, ChatModel, ChatRequest, LlmCapabilityAgent, OpenAiCompatibleModel};
pub use scripted::ScriptedAgent;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AgentError;
use crate::types::{AgentOutput, CapabilityTag, Message, Query, RetrievedChunk};

/// Everything an agent receives for one invocation. History is passed in
/// explicitly; agents never reach into shared conversation state.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub query: Query,
    pub context: Vec<RetrievedChunk>,
    pub history: Vec<Message>,
    pub timeout: Duration,
    /// False when retrieval failed and the agent runs without context.
    pub grounded: bool,
}

impl AgentRequest {
    pub fn context_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::with_capacity(self.context.len());
        for chunk in &self.context {
            if !ids.contains(&chunk.source_id) {
                ids.push(chunk.source_id.clone());
            }
        }
        ids
    }
}

/// Answer text plus the source ids it relied on.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub citations: Vec<String>,
    pub confidence: Option<f64>,
}

impl AgentReply {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            citations: Vec::new(),
            confidence: None,
        }
    }

    pub fn with_citations(mut self, citations: Vec<String>) -> Self {
        self.citations = citations;
        self
    }
}

impl From<AgentReply> for AgentOutput {
    fn from(reply: AgentReply) -> Self {
        AgentOutput {
            text: reply.text,
            citations: reply.citations,
            confidence: reply.confidence,
        }
    }
}

/// A specialist answering capability.
#[async_trait]
pub trait CapabilityAgent: Send + Sync {
    /// Stable identifier, used in answer metadata and logs.
    fn id(&self) -> &str;

    fn capability(&self) -> CapabilityTag;

    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, AgentError>;
}

/// One agent per capability tag.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<CapabilityTag, Arc<dyn CapabilityAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its capability, returning any agent it replaced.
    pub fn register(&mut self, agent: Arc<dyn CapabilityAgent>) -> Option<Arc<dyn CapabilityAgent>> {
        self.agents.insert(agent.capability(), agent)
    }

    pub fn with(mut self, agent: Arc<dyn CapabilityAgent>) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, tag: CapabilityTag) -> Option<Arc<dyn CapabilityAgent>> {
        self.agents.get(&tag).cloned()
    }

    pub fn capabilities(&self) -> Vec<CapabilityTag> {
        self.agents.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.agents.iter().map(|(tag, agent)| (tag, agent.id())))
            .finish()
    }
}
