//! # MedRoute Core
//!
//! Safety-gated pipeline that routes medical questions to specialist
//! capability agents. Provides intent classification, partitioned retrieval,
//! concurrent dispatch with deterministic merge, a content-addressed response
//! cache, the safety filter, configuration, and the fundamental types.

pub mod agents;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod intent;
pub mod orchestrator;
pub mod pipeline;
pub mod retriever;
pub mod safety;
pub mod types;

// Re-export commonly used types at the crate root.
pub use agents::{
    AgentRegistry, AgentReply, AgentRequest, CapabilityAgent, ExtractiveAgent,
    LlmCapabilityAgent, OpenAiCompatibleModel, ScriptedAgent,
};
pub use cache::{CacheConfig, ResponseCache, fingerprint, fingerprint_scoped};
pub use config::{MedRouteConfig, load_config, load_config_file};
pub use conversation::{ConversationStore, InMemoryConversationStore};
pub use embeddings::{Embedder, LocalEmbedder};
pub use error::{AgentError, ConfigError, IndexError, MedRouteError, PipelineError, Result};
pub use index::{InMemoryKnowledgeIndex, KnowledgeDocument, KnowledgeIndex, SearchFilter};
pub use intent::{IntentClassifier, KeywordIntentClassifier};
pub use orchestrator::{ConflictPolicy, Orchestrator, OrchestratorConfig};
pub use pipeline::{AnswerPipeline, PipelineComponents, PipelineStats};
pub use retriever::{ContextAssembler, Retriever, RetrieverConfig};
pub use safety::{DISCLAIMER, EMERGENCY_TEMPLATE, SafetyFilter};
pub use types::{
    AttachmentKind, CapabilityTag, ErrorKind, Intent, MergedAnswer, Message, PipelineOutcome,
    Query, Role,
};
