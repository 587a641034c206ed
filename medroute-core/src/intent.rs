//! Intent classification into the closed capability tag set.
//!
//! Every capability is scored independently by keyword affinity and every
//! tag at or above the activation threshold fires, so a single question can
//! route to several capabilities. Scores per normalized text are memoized in
//! an LRU cache.

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;

use crate::types::{AttachmentKind, CapabilityTag, Intent, Message, Query, Role};

/// Swappable intent classifier.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Classify `query` given the recent conversation window (oldest first).
    async fn classify(&self, query: &Query, history: &[Message]) -> Intent;

    fn name(&self) -> &str;
}

/// Extra keywords appended to the built-in lexicon, per capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordOverrides {
    #[serde(default)]
    pub qa: Vec<String>,
    #[serde(default)]
    pub drug_info: Vec<String>,
    #[serde(default)]
    pub document: Vec<String>,
    #[serde(default)]
    pub image: Vec<String>,
}

impl KeywordOverrides {
    fn for_capability(&self, tag: CapabilityTag) -> &[String] {
        match tag {
            CapabilityTag::Qa => &self.qa,
            CapabilityTag::DrugInfo => &self.drug_info,
            CapabilityTag::Document => &self.document,
            CapabilityTag::Image => &self.image,
        }
    }
}

/// Intent classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Minimum score for a capability to fire.
    #[serde(default = "default_activation_threshold")]
    pub activation_threshold: f64,
    /// Confidence multiplier applied per step back in the conversation window.
    #[serde(default = "default_history_decay")]
    pub history_decay: f64,
    /// Number of previous user messages consulted for follow-up questions.
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
    /// Size of the text → scores LRU cache.
    #[serde(default = "default_cache_size")]
    pub classification_cache_size: usize,
    /// Capability used when nothing fires. `None` surfaces `NoCapabilityMatch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_capability: Option<CapabilityTag>,
    #[serde(default)]
    pub extra_keywords: KeywordOverrides,
    /// Additional drug names recognized as medicine mentions.
    #[serde(default)]
    pub extra_drug_names: Vec<String>,
}

fn default_activation_threshold() -> f64 {
    0.3
}
fn default_history_decay() -> f64 {
    0.5
}
fn default_history_messages() -> usize {
    3
}
fn default_cache_size() -> usize {
    256
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 0.3,
            history_decay: 0.5,
            history_messages: 3,
            classification_cache_size: 256,
            fallback_capability: None,
            extra_keywords: KeywordOverrides::default(),
            extra_drug_names: Vec::new(),
        }
    }
}

// =============================================================================
// Lexicon
// =============================================================================

fn builtin_keywords(tag: CapabilityTag) -> &'static [&'static str] {
    match tag {
        CapabilityTag::Qa => &[
            "symptom", "symptoms", "disease", "condition", "fever", "headache", "pain",
            "diabetes", "blood pressure", "hypertension", "cholesterol", "infection", "cough",
            "cold", "flu", "allergy", "asthma", "cause", "causes", "prevent", "healthy",
            "health", "diet", "eat", "eating", "food", "foods", "fruit", "fruits", "banana",
            "bananas", "vegetables", "drink", "alcohol", "coffee", "exercise", "sleep",
            "weight", "pregnancy", "pregnant", "vitamin", "vitamins", "lifestyle", "treat",
            "treatment", "heal", "recover", "recovery", "home remedy",
        ],
        CapabilityTag::DrugInfo => &[
            "medicine", "medicines", "medication", "medications", "drug", "drugs", "tablet",
            "tablets", "pill", "pills", "capsule", "capsules", "syrup", "dose", "dosage",
            "mg", "side effect", "side effects", "interaction", "interactions", "generic",
            "brand", "contraindication", "contraindications", "prescribed",
        ],
        CapabilityTag::Document => &[
            "report", "reports", "my prescription", "prescription", "document", "documents",
            "lab result", "lab results", "blood test", "test results", "summary", "summarize",
            "summarise", "discharge", "uploaded", "my records", "medical record",
        ],
        CapabilityTag::Image => &[
            "image", "photo", "picture", "x ray", "xray", "scan", "mri", "ct scan",
            "ultrasound", "radiograph", "look at this", "rash photo",
        ],
    }
}

fn builtin_negatives(tag: CapabilityTag) -> &'static [&'static str] {
    match tag {
        CapabilityTag::Qa => &[],
        CapabilityTag::DrugInfo => &["illegal drugs", "recreational"],
        CapabilityTag::Document => &["book report", "news report"],
        CapabilityTag::Image => &["self image", "body image"],
    }
}

const DRUG_NAMES: &[&str] = &[
    "paracetamol", "acetaminophen", "ibuprofen", "aspirin", "metformin", "insulin",
    "amoxicillin", "azithromycin", "atorvastatin", "lisinopril", "amlodipine", "omeprazole",
    "pantoprazole", "levothyroxine", "cetirizine", "losartan", "warfarin", "prednisone",
    "crocin", "dolo", "diclofenac", "naproxen", "clopidogrel", "salbutamol",
];

const DRUG_SUFFIXES: &[&str] = &[
    "formin", "statin", "pril", "sartan", "olol", "dipine", "prazole", "azole", "cillin",
    "mycin", "cycline", "floxacin", "gliptin", "tidine", "oxetine", "mab",
];

/// Lowercase, strip apostrophes and map every other non-alphanumeric to a
/// space, then pad so keywords can be matched on word boundaries.
pub fn normalize_for_matching(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    let mut last_space = true;
    for c in text.to_lowercase().chars() {
        if c == '\'' || c == '\u{2019}' {
            continue;
        }
        if c.is_alphanumeric() {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if !last_space {
        out.push(' ');
    }
    out
}

fn contains_term(padded: &str, term: &str) -> bool {
    let normalized = normalize_for_matching(term);
    !normalized.trim().is_empty() && padded.contains(&normalized)
}

// =============================================================================
// Keyword classifier
// =============================================================================

/// Classification statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassifierStats {
    pub total_classified: u64,
    pub cache_hits: u64,
    pub history_fallbacks: u64,
    pub configured_fallbacks: u64,
    pub no_match: u64,
    pub multi_capability: u64,
    pub capability_hits: BTreeMap<CapabilityTag, u64>,
}

/// Deterministic keyword-affinity classifier.
pub struct KeywordIntentClassifier {
    config: IntentConfig,
    cache: Mutex<LruCache<String, BTreeMap<CapabilityTag, f64>>>,
    stats: Mutex<ClassifierStats>,
}

impl KeywordIntentClassifier {
    pub fn new(config: IntentConfig) -> Self {
        let cache_size =
            NonZeroUsize::new(config.classification_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            cache: Mutex::new(LruCache::new(cache_size)),
            stats: Mutex::new(ClassifierStats::default()),
        }
    }

    pub fn config(&self) -> &IntentConfig {
        &self.config
    }

    pub fn stats(&self) -> ClassifierStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Raw affinity score per capability for `text`, memoized.
    pub fn score_text(&self, text: &str) -> BTreeMap<CapabilityTag, f64> {
        let padded = normalize_for_matching(text);
        let key = padded.trim().to_string();

        if let Ok(mut cache) = self.cache.lock()
            && let Some(scores) = cache.get(&key)
        {
            if let Ok(mut stats) = self.stats.lock() {
                stats.cache_hits += 1;
            }
            return scores.clone();
        }

        let scores: BTreeMap<CapabilityTag, f64> = CapabilityTag::all()
            .iter()
            .map(|&tag| (tag, self.keyword_affinity(&padded, tag)))
            .collect();

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, scores.clone());
        }
        scores
    }

    /// 1 − 0.5^matches − 0.3·negatives, clamped to [0, 1].
    fn keyword_affinity(&self, padded: &str, tag: CapabilityTag) -> f64 {
        let mut matched = builtin_keywords(tag)
            .iter()
            .filter(|kw| contains_term(padded, kw))
            .count()
            + self
                .config
                .extra_keywords
                .for_capability(tag)
                .iter()
                .filter(|kw| contains_term(padded, kw))
                .count();

        if tag == CapabilityTag::DrugInfo {
            matched += self.drug_mentions(padded);
        }

        let negated = builtin_negatives(tag)
            .iter()
            .filter(|kw| contains_term(padded, kw))
            .count();

        if matched == 0 {
            return 0.0;
        }
        let score = 1.0 - 0.5f64.powi(matched as i32) - 0.3 * negated as f64;
        score.clamp(0.0, 1.0)
    }

    /// Distinct tokens that are known drug names or carry a drug-name suffix.
    fn drug_mentions(&self, padded: &str) -> usize {
        let tokens: BTreeSet<&str> = padded.split_whitespace().collect();
        tokens
            .iter()
            .filter(|token| {
                DRUG_NAMES.contains(*token)
                    || self
                        .config
                        .extra_drug_names
                        .iter()
                        .any(|name| name.eq_ignore_ascii_case(token))
                    || (token.len() >= 6 && DRUG_SUFFIXES.iter().any(|s| token.ends_with(s)))
            })
            .count()
    }

    fn fired(&self, scores: &BTreeMap<CapabilityTag, f64>, weight: f64) -> BTreeMap<CapabilityTag, f64> {
        scores
            .iter()
            .map(|(&tag, &score)| (tag, score * weight))
            .filter(|(_, score)| *score >= self.config.activation_threshold)
            .collect()
    }

    /// Score previous user messages, newest first, with decaying weight.
    fn classify_from_history(&self, history: &[Message]) -> BTreeMap<CapabilityTag, f64> {
        let mut confidence: BTreeMap<CapabilityTag, f64> = BTreeMap::new();
        let user_messages = history
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .take(self.config.history_messages);

        for (step, message) in user_messages.enumerate() {
            let weight = self.config.history_decay.powi(step as i32);
            for (tag, score) in self.fired(&self.score_text(&message.content), weight) {
                let entry = confidence.entry(tag).or_insert(0.0);
                if score > *entry {
                    *entry = score;
                }
            }
        }
        confidence
    }

    fn record(&self, intent: &Intent, history_fallback: bool, configured_fallback: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.total_classified += 1;
            if history_fallback {
                stats.history_fallbacks += 1;
            }
            if configured_fallback {
                stats.configured_fallbacks += 1;
            }
            if intent.is_empty() {
                stats.no_match += 1;
            }
            if intent.confidence.len() > 1 {
                stats.multi_capability += 1;
            }
            for tag in intent.confidence.keys() {
                *stats.capability_hits.entry(*tag).or_insert(0) += 1;
            }
        }
    }
}

impl Default for KeywordIntentClassifier {
    fn default() -> Self {
        Self::new(IntentConfig::default())
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(&self, query: &Query, history: &[Message]) -> Intent {
        let mut confidence = self.fired(&self.score_text(&query.text), 1.0);

        if let Some(attachment) = &query.attachment {
            let tag = match attachment.kind {
                AttachmentKind::Document => CapabilityTag::Document,
                AttachmentKind::Image => CapabilityTag::Image,
            };
            confidence.insert(tag, 1.0);
        }

        let mut from_history = false;
        if confidence.is_empty() {
            confidence = self.classify_from_history(history);
            from_history = !confidence.is_empty();
        }

        let mut configured_fallback = false;
        if confidence.is_empty()
            && let Some(tag) = self.config.fallback_capability
        {
            confidence.insert(tag, self.config.activation_threshold);
            configured_fallback = true;
        }

        let intent = Intent {
            confidence,
            from_history,
        };
        self.record(&intent, from_history, configured_fallback);
        debug!(
            query_id = %query.id,
            tags = ?intent.tags(),
            from_history,
            "Classified query intent"
        );
        intent
    }

    fn name(&self) -> &str {
        "keyword"
    }
}
