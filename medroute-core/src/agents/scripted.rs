//! Deterministic agent with a fixed reply, used by tests and the demo CLI.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{AgentReply, AgentRequest, CapabilityAgent};
use crate::error::AgentError;
use crate::types::CapabilityTag;

pub struct ScriptedAgent {
    id: String,
    capability: CapabilityTag,
    text: String,
    citations: Option<Vec<String>>,
    confidence: Option<f64>,
    delay: Duration,
    fail: bool,
    dispatches: Arc<AtomicUsize>,
    last_request: Mutex<Option<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(id: impl Into<String>, capability: CapabilityTag, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability,
            text: text.into(),
            citations: None,
            confidence: None,
            delay: Duration::ZERO,
            fail: false,
            dispatches: Arc::new(AtomicUsize::new(0)),
            last_request: Mutex::new(None),
        }
    }

    /// Cite these ids instead of the ids of the context received.
    pub fn with_citations(mut self, citations: &[&str]) -> Self {
        self.citations = Some(citations.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Sleep this long before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Always fail with `RequestFailed`.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Share a dispatch counter with other agents.
    pub fn with_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.dispatches = counter;
        self
    }

    /// Number of times `invoke` was entered.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.dispatches)
    }

    pub fn last_request(&self) -> Option<AgentRequest> {
        self.last_request.lock().ok().and_then(|r| r.clone())
    }
}

#[async_trait]
impl CapabilityAgent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capability(&self) -> CapabilityTag {
        self.capability
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        let citations = self
            .citations
            .clone()
            .unwrap_or_else(|| request.context_ids());
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(request);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(AgentError::RequestFailed {
                agent: self.id.clone(),
                message: "scripted failure".into(),
            });
        }

        Ok(AgentReply {
            text: self.text.clone(),
            citations,
            confidence: self.confidence,
        })
    }
}
