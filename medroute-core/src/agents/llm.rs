//! Model-backed capability agents.
//!
//! [`LlmCapabilityAgent`] turns an [`AgentRequest`] into a chat completion:
//! a capability system prompt, the conversation window, and a user turn
//! carrying the numbered sources. [`OpenAiCompatibleModel`] speaks the
//! OpenAI chat completions format, which also covers Ollama, vLLM and
//! LM Studio endpoints.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{AgentReply, AgentRequest, CapabilityAgent, prompts};
use crate::config::ModelConfig;
use crate::error::AgentError;
use crate::retriever::ContextAssembler;
use crate::types::{CapabilityTag, Role};

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// A chat completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, AgentError>;

    fn model_name(&self) -> &str;
}

// =============================================================================
// OpenAI-compatible HTTP model
// =============================================================================

pub struct OpenAiCompatibleModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiCompatibleModel {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Connection {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// Build from configuration, reading the API key from the configured variable.
    pub fn from_config(config: &ModelConfig) -> Result<Self, AgentError> {
        let api_key =
            std::env::var(&config.api_key_env).map_err(|_| AgentError::MissingApiKey {
                var: config.api_key_env.clone(),
            })?;
        Self::new(
            &config.base_url,
            &config.model,
            api_key,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.to_string(), "content": m.content }))
            .collect();
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        })
    }

    fn parse_response(&self, json: &Value) -> Result<String, AgentError> {
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::ResponseParse {
                agent: self.model.clone(),
                message: "missing choices[0].message.content".into(),
            })?;
        Ok(content.to_string())
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    async fn complete(&self, request: ChatRequest) -> Result<String, AgentError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(&request);

        debug!(url = %url, model = %self.model, "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Connection {
                message: format!("Request failed: {e}"),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| AgentError::RequestFailed {
            agent: self.model.clone(),
            message: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(AgentError::RequestFailed {
                agent: self.model.clone(),
                message: format!("HTTP {status}: {text}"),
            });
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| AgentError::ResponseParse {
            agent: self.model.clone(),
            message: format!("Invalid JSON: {e}"),
        })?;
        self.parse_response(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// Capability agent over a chat model
// =============================================================================

pub struct LlmCapabilityAgent {
    id: String,
    capability: CapabilityTag,
    model: Arc<dyn ChatModel>,
    temperature: f32,
    max_tokens: usize,
    max_history: usize,
    assembler: ContextAssembler,
}

impl LlmCapabilityAgent {
    pub fn new(capability: CapabilityTag, model: Arc<dyn ChatModel>) -> Self {
        Self {
            id: format!("llm-{}", capability.as_str()),
            capability,
            model,
            temperature: 0.3,
            max_tokens: 1024,
            max_history: 6,
            assembler: ContextAssembler::default(),
        }
    }

    /// Build one agent per capability sharing the configured model.
    pub fn from_config(
        capability: CapabilityTag,
        model: Arc<dyn ChatModel>,
        config: &ModelConfig,
        max_context_chars: usize,
    ) -> Self {
        Self::new(capability, model)
            .with_temperature(config.temperatures.for_capability(capability))
            .with_max_tokens(config.max_tokens)
            .with_context_budget(max_context_chars)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_context_budget(mut self, max_chars: usize) -> Self {
        self.assembler = ContextAssembler::new(max_chars);
        self
    }

    /// Chat messages for a request, plus the source ids rendered into them.
    pub fn build_messages(&self, request: &AgentRequest) -> (Vec<ChatMessage>, Vec<String>) {
        let context = self.assembler.assemble(&request.context);
        let mut messages = vec![ChatMessage::new(
            Role::System,
            prompts::system_prompt(self.capability),
        )];

        let skip = request.history.len().saturating_sub(self.max_history);
        messages.extend(
            request
                .history
                .iter()
                .skip(skip)
                .filter(|m| m.role != Role::System)
                .map(|m| ChatMessage::new(m.role, m.content.clone())),
        );
        messages.push(ChatMessage::new(
            Role::User,
            prompts::user_prompt(&request.query.text, &context.text),
        ));
        (messages, context.sources_used)
    }
}

#[async_trait]
impl CapabilityAgent for LlmCapabilityAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capability(&self) -> CapabilityTag {
        self.capability
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        let (messages, citations) = self.build_messages(&request);
        let text = self
            .model
            .complete(ChatRequest {
                messages,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            })
            .await?;

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(AgentError::EmptyResponse {
                agent: self.id.clone(),
            });
        }

        let confidence = if request.context.is_empty() {
            None
        } else {
            let total: f32 = request.context.iter().map(|c| c.similarity).sum();
            Some(f64::from(total / request.context.len() as f32))
        };

        Ok(AgentReply {
            text,
            citations,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, Query, RetrievedChunk};
    use chrono::Utc;
    use std::sync::Mutex;

    struct MockChatModel {
        reply: String,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockChatModel {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.into(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for MockChatModel {
        async fn complete(&self, request: ChatRequest) -> Result<String, AgentError> {
            self.requests.lock().unwrap().push(request);
            Ok(self.reply.clone())
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    fn request(context: Vec<RetrievedChunk>, history: Vec<Message>) -> AgentRequest {
        AgentRequest {
            query: Query::new("What is metformin?", "u1", "c1"),
            grounded: true,
            context,
            history,
            timeout: Duration::from_secs(3),
        }
    }

    fn chunk(id: &str, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            source_id: id.into(),
            text: text.into(),
            similarity: 0.8,
            origin_category: Some("drug_database".into()),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_llm_agent_builds_prompt_and_cites() {
        let model = Arc::new(MockChatModel::new("  Metformin treats type 2 diabetes.  "));
        let agent = LlmCapabilityAgent::new(CapabilityTag::DrugInfo, model.clone())
            .with_temperature(0.2);
        let reply = agent
            .invoke(request(
                vec![chunk("kb-1", "Metformin is an oral antidiabetic.")],
                vec![
                    Message::user("c1", "hi"),
                    Message::assistant("c1", "hello"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(reply.text, "Metformin treats type 2 diabetes.");
        assert_eq!(reply.citations, vec!["kb-1"]);
        assert!(reply.confidence.is_some());

        let requests = model.requests.lock().unwrap();
        let sent = &requests[0];
        assert!((sent.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(sent.messages.len(), 4);
        assert_eq!(sent.messages[0].role, Role::System);
        assert_eq!(sent.messages[1].content, "hi");
        assert!(sent.messages[3].content.contains("[Source 1] (Relevance: 0.80)"));
        assert!(sent.messages[3].content.ends_with("Question: What is metformin?"));
    }

    #[tokio::test]
    async fn test_llm_agent_history_window() {
        let model = Arc::new(MockChatModel::new("ok"));
        let agent = LlmCapabilityAgent::new(CapabilityTag::Qa, model.clone());
        let history = (0..10).map(|i| Message::user("c1", format!("m{i}"))).collect();
        agent.invoke(request(Vec::new(), history)).await.unwrap();
        let requests = model.requests.lock().unwrap();
        // system + 6 history + user
        assert_eq!(requests[0].messages.len(), 8);
        assert_eq!(requests[0].messages[1].content, "m4");
    }

    #[tokio::test]
    async fn test_llm_agent_empty_reply() {
        let agent = LlmCapabilityAgent::new(CapabilityTag::Qa, Arc::new(MockChatModel::new("   ")));
        let err = agent.invoke(request(Vec::new(), Vec::new())).await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyResponse { .. }));
    }

    #[test]
    fn test_openai_request_body() {
        let model =
            OpenAiCompatibleModel::new("http://localhost:11434/v1/", "llama3.2", "k", Duration::from_secs(5))
                .unwrap();
        assert_eq!(model.base_url, "http://localhost:11434/v1");
        let body = model.request_body(&ChatRequest {
            messages: vec![ChatMessage::new(Role::System, "s"), ChatMessage::new(Role::User, "u")],
            temperature: 0.5,
            max_tokens: 256,
        });
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "u");
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn test_openai_parse_response() {
        let model = OpenAiCompatibleModel::new("http://x", "m", "k", Duration::from_secs(1)).unwrap();
        let ok = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(model.parse_response(&ok).unwrap(), "hi");
        let bad = json!({"error": "nope"});
        assert!(matches!(
            model.parse_response(&bad),
            Err(AgentError::ResponseParse { .. })
        ));
    }

    #[test]
    fn test_from_config_missing_key() {
        let config = ModelConfig {
            api_key_env: "MEDROUTE_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..Default::default()
        };
        let err = OpenAiCompatibleModel::from_config(&config).err().unwrap();
        assert_eq!(
            err,
            AgentError::MissingApiKey {
                var: "MEDROUTE_TEST_KEY_THAT_IS_NEVER_SET".into()
            }
        );
    }
}
