//! Error types for the medroute core.
//!
//! Uses `thiserror` for public API error types. Pipeline outcomes that are
//! policy decisions (escalation, refusal) live in the same taxonomy as system
//! faults but are distinguished by [`PipelineError::is_system_fault`].

use std::path::PathBuf;

/// Generic message shown to users for any system fault.
pub const RETRY_LATER_MESSAGE: &str =
    "Sorry, something went wrong while answering your question. Please try again later.";

/// Message shown when no agent could produce an answer.
pub const INSUFFICIENT_INFORMATION_MESSAGE: &str = "I don't have enough information to answer \
     that reliably right now. Please try again later or consult a healthcare professional.";

/// Message shown when the question maps to no supported capability.
pub const NO_CAPABILITY_MESSAGE: &str = "I can help with general health questions, medicine \
     information, and your uploaded medical documents or images. Could you rephrase your question?";

/// Top-level error type for the medroute core library.
#[derive(Debug, thiserror::Error)]
pub enum MedRouteError {
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Knowledge index error: {0}")]
    Index(#[from] IndexError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors and terminal outcomes of a single query's trip through the pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("No capability matched the query intent")]
    NoCapabilityMatch,

    #[error("All {attempted} dispatched agents failed or timed out")]
    AllAgentsUnavailable { attempted: usize },

    #[error("Retrieval unavailable: {message}")]
    RetrievalUnavailable { message: String },

    #[error("Agent '{agent}' timed out after {timeout_ms}ms")]
    AgentTimeout { agent: String, timeout_ms: u64 },

    #[error("Answer refused by safety policy: {rule}")]
    SafetyRefusal { rule: String },

    #[error("Escalation triggered by '{matched}'")]
    EscalationTriggered { matched: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl PipelineError {
    /// Whether this is a failure of the system rather than a policy decision.
    ///
    /// Refusals and escalations are deliberate outcomes; callers and telemetry
    /// must be able to tell "declined to answer" apart from "failed to answer".
    pub fn is_system_fault(&self) -> bool {
        !matches!(
            self,
            PipelineError::SafetyRefusal { .. } | PipelineError::EscalationTriggered { .. }
        )
    }

    /// Whether the query can still produce an answer after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::RetrievalUnavailable { .. } | PipelineError::AgentTimeout { .. }
        )
    }

    /// The text shown to an end user. Never contains internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::NoCapabilityMatch => NO_CAPABILITY_MESSAGE,
            PipelineError::AllAgentsUnavailable { .. } => INSUFFICIENT_INFORMATION_MESSAGE,
            _ => RETRY_LATER_MESSAGE,
        }
    }
}

/// Errors from a capability agent or the model behind it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("Agent '{agent}' request failed: {message}")]
    RequestFailed { agent: String, message: String },

    #[error("Agent '{agent}' returned an unparseable response: {message}")]
    ResponseParse { agent: String, message: String },

    #[error("Agent '{agent}' returned an empty answer")]
    EmptyResponse { agent: String },

    #[error("Agent '{agent}' has no grounding context to answer from")]
    NoContext { agent: String },

    #[error("Model provider connection failed: {message}")]
    Connection { message: String },

    #[error("API key environment variable not set: {var}")]
    MissingApiKey { var: String },
}

/// Errors from the knowledge index.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexError {
    #[error("Knowledge index unreachable: {message}")]
    Unreachable { message: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid knowledge document '{source_id}': {reason}")]
    InvalidDocument { source_id: String, reason: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `MedRouteError`.
pub type Result<T> = std::result::Result<T, MedRouteError>;
