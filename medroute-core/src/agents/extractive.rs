//! Model-free agent that answers by extracting sentences from retrieved context.

use async_trait::async_trait;
use std::collections::HashSet;

use super::{AgentReply, AgentRequest, CapabilityAgent};
use crate::embeddings::tokenize;
use crate::error::AgentError;
use crate::types::CapabilityTag;

/// Terms too common to signal relevance.
const STOPWORDS: &[&str] = &[
    "what", "which", "when", "where", "does", "with", "that", "this", "have", "from", "about",
    "there", "their", "your", "should", "could", "would", "into", "take", "can",
];

pub struct ExtractiveAgent {
    id: String,
    capability: CapabilityTag,
    max_sentences: usize,
}

impl ExtractiveAgent {
    pub fn new(capability: CapabilityTag) -> Self {
        Self {
            id: format!("extractive-{}", capability.as_str()),
            capability,
            max_sentences: 3,
        }
    }

    pub fn with_max_sentences(mut self, max_sentences: usize) -> Self {
        self.max_sentences = max_sentences.max(1);
        self
    }
}

fn query_terms(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.len() > 3 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Split text into sentences on terminal punctuation and newlines.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c == '\n' {
            push_sentence(&mut sentences, &mut current);
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            push_sentence(&mut sentences, &mut current);
        }
    }
    push_sentence(&mut sentences, &mut current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

#[async_trait]
impl CapabilityAgent for ExtractiveAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn capability(&self) -> CapabilityTag {
        self.capability
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        if request.context.is_empty() {
            return Err(AgentError::NoContext {
                agent: self.id.clone(),
            });
        }

        let terms = query_terms(&request.query.text);

        // (overlap, chunk rank, sentence position, text, source)
        let mut candidates: Vec<(usize, usize, usize, String, String)> = Vec::new();
        for (rank, chunk) in request.context.iter().enumerate() {
            for (pos, sentence) in split_sentences(&chunk.text).into_iter().enumerate() {
                let overlap = tokenize(&sentence)
                    .into_iter()
                    .filter(|t| terms.contains(t))
                    .collect::<HashSet<_>>()
                    .len();
                candidates.push((overlap, rank, pos, sentence, chunk.source_id.clone()));
            }
        }

        let any_overlap = candidates.iter().any(|c| c.0 > 0);
        if any_overlap {
            candidates.retain(|c| c.0 > 0);
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        candidates.truncate(self.max_sentences);
        // Restore reading order.
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let mut seen = HashSet::new();
        let mut sentences = Vec::new();
        let mut citations: Vec<String> = Vec::new();
        for (_, _, _, sentence, source) in candidates {
            if seen.insert(sentence.to_lowercase()) {
                sentences.push(sentence);
                if !citations.contains(&source) {
                    citations.push(source);
                }
            }
        }

        if sentences.is_empty() {
            return Err(AgentError::EmptyResponse {
                agent: self.id.clone(),
            });
        }

        let used: Vec<f32> = request
            .context
            .iter()
            .filter(|c| citations.contains(&c.source_id))
            .map(|c| c.similarity)
            .collect();
        let confidence = (!used.is_empty())
            .then(|| f64::from(used.iter().sum::<f32>() / used.len() as f32));

        Ok(AgentReply {
            text: sentences.join(" "),
            citations,
            confidence,
        })
    }
}
