//! CLI subcommand handlers and pipeline assembly.

use crate::Commands;
use crate::ConfigAction;
use medroute_core::agents::{ChatModel, ExtractiveAgent, LlmCapabilityAgent, OpenAiCompatibleModel};
use medroute_core::config::MedRouteConfig;
use medroute_core::conversation::InMemoryConversationStore;
use medroute_core::embeddings::{Embedder, LocalEmbedder};
use medroute_core::index::InMemoryKnowledgeIndex;
use medroute_core::intent::{IntentClassifier, KeywordIntentClassifier};
use medroute_core::safety::SafetyFilter;
use medroute_core::types::{CapabilityTag, MergedAnswer, Query};
use medroute_core::{AgentRegistry, AnswerPipeline};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: MedRouteConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Ask { question } => {
            let pipeline = build_pipeline(&config)?;
            crate::repl::run_single_question(&pipeline, &question, "local", false).await
        }
        Commands::Config { action } => handle_config(action, &config, workspace),
        Commands::Classify { question } => handle_classify(&question, &config).await,
        Commands::Check { text } => handle_check(&text, &config),
    }
}

fn handle_config(
    action: ConfigAction,
    config: &MedRouteConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".medroute");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&MedRouteConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

async fn handle_classify(question: &str, config: &MedRouteConfig) -> anyhow::Result<()> {
    let classifier = KeywordIntentClassifier::new(config.intent.clone());
    let intent = classifier
        .classify(&Query::new(question, "local", "classify"), &[])
        .await;
    if intent.is_empty() {
        println!("No capability matched.");
        return Ok(());
    }
    for (tag, confidence) in &intent.confidence {
        println!("  {:<10} {:.2}  {}", tag.as_str(), confidence, tag.display_name());
    }
    Ok(())
}

fn handle_check(text: &str, config: &MedRouteConfig) -> anyhow::Result<()> {
    let filter = SafetyFilter::new(&config.safety)?;
    let query = Query::new("", "local", "check");
    let escalation = filter.escalation_matches(text);
    if !escalation.is_empty() {
        println!("Escalation terms: {}", escalation.join(", "));
    }
    let answer = MergedAnswer {
        text: text.to_string(),
        segments: Vec::new(),
        citations: Vec::new(),
        contributing_agents: BTreeSet::new(),
        metadata: Default::default(),
    };
    match filter.post_check(&query, answer) {
        Ok(checked) => println!("{}", checked.text),
        Err(refusal) => println!("Refused ({}): {}", refusal.rule, refusal.text),
    }
    Ok(())
}

/// Assemble the pipeline from configuration.
///
/// Agents call the configured chat model when its API key is present and
/// fall back to extractive agents over the knowledge index otherwise.
pub fn build_pipeline(config: &MedRouteConfig) -> anyhow::Result<AnswerPipeline> {
    let embedder: Arc<dyn Embedder> =
        Arc::new(LocalEmbedder::new(config.knowledge.embedding_dimensions));
    let index = Arc::new(
        InMemoryKnowledgeIndex::new(Arc::clone(&embedder))
            .with_chunking(config.knowledge.chunk_words, config.knowledge.chunk_overlap),
    );
    if let Some(path) = &config.knowledge.path {
        index
            .load_json_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load knowledge from {}: {}", path.display(), e))?;
    }

    let registry = build_registry(config);
    tracing::info!(
        capabilities = ?registry.capabilities(),
        documents = index.len(),
        "Pipeline assembled"
    );

    AnswerPipeline::from_config(
        config,
        registry,
        index,
        embedder,
        Arc::new(InMemoryConversationStore::new()),
    )
    .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn build_registry(config: &MedRouteConfig) -> AgentRegistry {
    let model_config = config.model.clone().unwrap_or_default();
    match OpenAiCompatibleModel::from_config(&model_config) {
        Ok(model) => {
            let model: Arc<dyn ChatModel> = Arc::new(model);
            CapabilityTag::all()
                .iter()
                .fold(AgentRegistry::new(), |registry, &tag| {
                    registry.with(Arc::new(LlmCapabilityAgent::from_config(
                        tag,
                        Arc::clone(&model),
                        &model_config,
                        config.retrieval.max_context_chars,
                    )))
                })
        }
        Err(e) => {
            tracing::warn!("Chat model unavailable: {}. Using extractive agents.", e);
            [CapabilityTag::Qa, CapabilityTag::DrugInfo, CapabilityTag::Document]
                .into_iter()
                .fold(AgentRegistry::new(), |registry, tag| {
                    registry.with(Arc::new(ExtractiveAgent::new(tag)))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_pipeline_with_defaults() {
        let mut config = MedRouteConfig::default();
        config.model = Some(medroute_core::config::ModelConfig {
            api_key_env: "MEDROUTE_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..Default::default()
        });
        let pipeline = build_pipeline(&config).unwrap();
        assert_eq!(
            pipeline.orchestrator().registry().capabilities(),
            vec![CapabilityTag::Qa, CapabilityTag::DrugInfo, CapabilityTag::Document]
        );
    }

    #[test]
    fn test_missing_knowledge_file_is_an_error() {
        let mut config = MedRouteConfig::default();
        config.knowledge.path = Some("/nonexistent/knowledge.json".into());
        assert!(build_pipeline(&config).is_err());
    }
}
