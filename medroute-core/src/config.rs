//! Configuration system for medroute.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/medroute/config.toml` and/or `.medroute/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cache::CacheConfig;
use crate::intent::IntentConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::retriever::RetrieverConfig;
use crate::types::CapabilityTag;

/// Top-level configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedRouteConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub retrieval: RetrieverConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    /// Optional chat model backing the capability agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
}

/// Safety filter configuration. Built-in patterns are always active; these extend them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Additional escalation terms (matched case-insensitively on word boundaries,
    /// with common inflections of the last word).
    #[serde(default)]
    pub extra_escalation_terms: Vec<String>,
    /// Additional regex patterns whose sentence is rewritten with the safe completion.
    #[serde(default)]
    pub extra_rewrite_patterns: Vec<String>,
    /// Additional regex patterns that cause the whole answer to be refused.
    #[serde(default)]
    pub extra_refusal_patterns: Vec<String>,
    /// Maximum number of audit entries retained in memory.
    #[serde(default = "default_max_audit_entries")]
    pub max_audit_entries: usize,
}

fn default_max_audit_entries() -> usize {
    10_000
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            extra_escalation_terms: Vec::new(),
            extra_rewrite_patterns: Vec::new(),
            extra_refusal_patterns: Vec::new(),
            max_audit_entries: 10_000,
        }
    }
}

/// Knowledge loading configuration for the in-memory index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// JSON file of knowledge documents to index on startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Words per chunk.
    #[serde(default = "default_chunk_words")]
    pub chunk_words: usize,
    /// Word overlap between consecutive chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Dimensionality of the local embedder.
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

fn default_chunk_words() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_embedding_dimensions() -> usize {
    512
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            path: None,
            chunk_words: 500,
            chunk_overlap: 50,
            embedding_dimensions: 512,
        }
    }
}

/// OpenAI-compatible chat model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub temperatures: TemperatureConfig,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_max_tokens() -> usize {
    1024
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: 1024,
            request_timeout_secs: 30,
            temperatures: TemperatureConfig::default(),
        }
    }
}

/// Sampling temperature per capability. Factual capabilities run colder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureConfig {
    #[serde(default = "default_qa_temperature")]
    pub qa: f32,
    #[serde(default = "default_drug_temperature")]
    pub drug_info: f32,
    #[serde(default = "default_document_temperature")]
    pub document: f32,
    #[serde(default = "default_image_temperature")]
    pub image: f32,
}

fn default_qa_temperature() -> f32 {
    0.5
}
fn default_drug_temperature() -> f32 {
    0.2
}
fn default_document_temperature() -> f32 {
    0.3
}
fn default_image_temperature() -> f32 {
    0.3
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            qa: 0.5,
            drug_info: 0.2,
            document: 0.3,
            image: 0.3,
        }
    }
}

impl TemperatureConfig {
    pub fn for_capability(&self, tag: CapabilityTag) -> f32 {
        match tag {
            CapabilityTag::Qa => self.qa,
            CapabilityTag::DrugInfo => self.drug_info,
            CapabilityTag::Document => self.document,
            CapabilityTag::Image => self.image,
        }
    }
}

impl MedRouteConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        if !(0.0..=1.0).contains(&self.retrieval.min_similarity) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "retrieval.min_similarity must be within [0, 1], got {}",
                    self.retrieval.min_similarity
                ),
            });
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid {
                message: "retrieval.top_k must be at least 1".into(),
            });
        }
        if self.orchestrator.agent_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "orchestrator.agent_timeout_ms must be positive".into(),
            });
        }
        for tag in CapabilityTag::all() {
            if !self.orchestrator.priority.contains(tag) {
                return Err(ConfigError::Invalid {
                    message: format!("orchestrator.priority is missing capability '{tag}'"),
                });
            }
        }
        if self.knowledge.chunk_overlap >= self.knowledge.chunk_words {
            return Err(ConfigError::Invalid {
                message: "knowledge.chunk_overlap must be smaller than knowledge.chunk_words"
                    .into(),
            });
        }
        if self.knowledge.embedding_dimensions == 0 {
            return Err(ConfigError::Invalid {
                message: "knowledge.embedding_dimensions must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `MEDROUTE_`)
/// 3. Workspace-local config (`.medroute/config.toml`)
/// 4. User config (`~/.config/medroute/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&MedRouteConfig>,
) -> Result<MedRouteConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(MedRouteConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "medroute", "medroute") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".medroute").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (MEDROUTE_RETRIEVAL__TOP_K, MEDROUTE_CACHE__ENABLED, etc.)
    figment = figment.merge(Env::prefixed("MEDROUTE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Load configuration from an explicit TOML file layered over the defaults.
pub fn load_config_file(path: &Path) -> Result<MedRouteConfig, crate::error::ConfigError> {
    if !path.exists() {
        return Err(crate::error::ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Figment::from(Serialized::defaults(MedRouteConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("MEDROUTE_").split("__"))
        .extract()
        .map_err(|e| crate::error::ConfigError::ParseError {
            message: e.to_string(),
        })
}

/// Check whether a configuration file exists at user or workspace level.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "medroute", "medroute")
        && config_dir.config_dir().join("config.toml").exists()
    {
        return true;
    }

    if let Some(ws) = workspace
        && ws.join(".medroute").join("config.toml").exists()
    {
        return true;
    }

    false
}
