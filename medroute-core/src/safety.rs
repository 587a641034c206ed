//! Safety filter: inbound escalation, outbound rewrite/refusal, disclaimer.
//!
//! The pre-check runs before anything is dispatched and short-circuits on
//! emergency language. The post-check runs on the merged answer:
//! diagnostic claims are rewritten sentence by sentence, non-negated
//! instructions to alter a prescription refuse the whole answer, and the
//! disclaimer block is appended exactly once.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SafetyConfig;
use crate::error::{ConfigError, PipelineError};
use crate::intent::normalize_for_matching;
use crate::types::{EscalationResponse, MergedAnswer, Query, RefusalResponse};

/// Appended once to every delivered answer.
pub const DISCLAIMER: &str = "⚠️ **Medical Disclaimer**: This information is for educational \
purposes only and does not constitute medical advice, diagnosis, or treatment. Always consult a \
qualified healthcare professional before making any decisions about your health or treatment.";

/// Fixed response for escalated queries.
pub const EMERGENCY_TEMPLATE: &str = "🚨 **MEDICAL EMERGENCY**

This appears to be a medical emergency. Please:

1. **Call Emergency Services Immediately**: 112
2. **Or call an Ambulance**: 102
3. **Go to the nearest hospital** if you can

For mental health emergencies:
- NIMHANS Helpline: 080-46110007
- Vandrevala Foundation: 1860-2662-345

Do not wait for online advice in an emergency. Seek professional medical help now.";

/// Fixed response when an answer would alter a prescription.
pub const REFUSAL_MESSAGE: &str = "I can't advise on starting, stopping or changing the dose of \
a prescribed medicine. Please talk to the doctor or pharmacist who prescribed it before making \
any change.";

/// Replaces any sentence that reads as a diagnosis.
pub const SAFE_COMPLETION: &str = "Only a qualified healthcare professional who has examined you \
can diagnose a condition.";

/// Built-in escalation terms with the inflections they cover. Patterns run
/// against text normalized by `normalize_for_matching`.
const ESCALATION_PATTERNS: &[(&str, &str)] = &[
    ("chest pain", r"\bchest pains?\b"),
    ("heart attack", r"\bheart attacks?\b"),
    ("stroke", r"\bstrokes?\b"),
    ("severe bleeding", r"\bsevere(?:ly)? bleed(?:s|ing)?\b"),
    ("bleeding heavily", r"\bbleed(?:s|ing)? heavily\b"),
    ("suicide", r"\bsuicides?\b"),
    ("suicidal", r"\bsuicidal\b"),
    ("kill myself", r"\bkill(?:ing)? myself\b"),
    ("end my life", r"\bend(?:ing)? my life\b"),
    ("self harm", r"\bself harm(?:s|ed|ing)?\b"),
    ("overdose", r"\boverdos(?:e|es|ed|ing)\b"),
    ("can't breathe", r"\b(?:cant|cannot|can not|couldnt|unable to) breathe\b"),
    ("not breathing", r"\b(?:not|stopped|isnt|wasnt) breathing\b"),
    ("unconscious", r"\bunconscious(?:ness)?\b"),
    ("seizure", r"\b(?:seizures?|seizing)\b"),
    ("severe pain", r"\bsevere pains?\b"),
];

/// Hedges that still assert a diagnosis ("you probably have ...").
const HEDGES: &str = r"(?:most likely|almost certainly|probably|definitely|clearly|certainly|likely)";

/// Condition nouns and the suffixes of named conditions.
const CONDITIONS: &str = r"(?:disease|infection|cancer|diabetes|syndrome|disorder|tumou?r|pneumonia|asthma|hypertension|migraine|influenza|flu|dengue|malaria|typhoid|tuberculosis|\w+itis|\w+osis|\w+emia|\w+oma)";

fn rewrite_patterns() -> Vec<(&'static str, String)> {
    vec![
        (
            "diagnosis_statement",
            r"\b(?:my|the|your) diagnosis is\b".to_string(),
        ),
        (
            "diagnosed_with",
            r"\byou (?:are|have been|were) diagnosed with\b".to_string(),
        ),
        (
            "you_have_condition",
            format!(
                r"\byou(?: {HEDGES})?(?:['’]ve got| have got| have| are suffering from| suffer from) (?:an? |the )?(?:\w+ ){{0,2}}{CONDITIONS}\b"
            ),
        ),
        (
            "you_are_condition",
            format!(
                r"\byou(?: are|['’]re)(?: {HEDGES})? (?:diabetic|prediabetic|anaemic|anemic|hypertensive|asthmatic|epileptic|hypothyroid|hyperthyroid)\b"
            ),
        ),
        (
            "this_is_condition",
            format!(
                r"\b(?:this|it|that) (?:is {HEDGES}|looks like|sounds like) (?:an? )?(?:\w+ )?{CONDITIONS}\b"
            ),
        ),
    ]
}

const REFUSE_RULES: &[(&str, &str)] = &[
    (
        "stop_medication",
        r"\b(?:stop|discontinue|quit) (?:taking |using )?(?:your |the |this )?(?:\w+ )?(?:medication|medications|medicine|medicines|tablets|pills|insulin|prescription)\b",
    ),
    (
        "change_dose",
        r"\b(?:double|halve|increase|decrease|reduce|raise|lower|skip|change) (?:your |the |this )?(?:\w+ )?(?:dose|dosage|doses)\b",
    ),
    (
        "exceed_dose",
        r"\btake (?:twice|double|an extra|extra|more than) (?:the |your )?(?:prescribed )?(?:dose|amount|tablets?|pills?)\b",
    ),
];

/// Punctuation and conjunctions that start a new clause. Negation never
/// reaches across them.
const CLAUSE_BOUNDARY: &str = r"[,;:]|\b(?:if|unless|when|whenever|but|because|although)\b";

const NEGATIONS: &[&str] = &[
    "not", "never", "dont", "doesnt", "without", "avoid", "cannot", "shouldnt", "mustnt", "wont",
    "no",
];

/// Words allowed between a negation and the instruction it governs.
const NEGATION_FILLERS: &[&str] = &[
    "you", "should", "must", "ever", "please", "just", "to", "need", "it", "is", "safe", "a",
    "good", "idea", "suddenly", "abruptly", "yourself", "try",
];

/// Number of words before an instruction searched for its negation.
const NEGATION_SCOPE: usize = 5;

/// Words that make a following "you have ..." conditional rather than a claim.
const CONDITIONALS: &[&str] = &["if", "when", "whether", "unless", "once", "while", "case"];

/// Remove every copy of the disclaimer block from `text`.
pub fn strip_disclaimer(text: &str) -> String {
    text.replace(DISCLAIMER, "").trim_end().to_string()
}

/// Append the disclaimer block exactly once. Idempotent.
pub fn ensure_disclaimer(text: &str) -> String {
    let body = strip_disclaimer(text);
    if body.trim().is_empty() {
        DISCLAIMER.to_string()
    } else {
        format!("{body}\n\n{DISCLAIMER}")
    }
}

// =============================================================================
// Query lifecycle
// =============================================================================

/// Stage of one query in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    Received,
    PreChecked,
    Escalated,
    Routed,
    Merged,
    PostChecked,
    Refused,
    Delivered,
    Failed,
}

impl QueryStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryStage::Escalated | QueryStage::Refused | QueryStage::Delivered | QueryStage::Failed
        )
    }

    pub fn can_transition_to(&self, next: QueryStage) -> bool {
        use QueryStage::*;
        matches!(
            (self, next),
            (Received, PreChecked)
                | (PreChecked, Escalated)
                | (PreChecked, Routed)
                | (PreChecked, Failed)
                | (Routed, Merged)
                | (Routed, Delivered)
                | (Routed, Failed)
                | (Merged, PostChecked)
                | (Merged, Failed)
                | (PostChecked, Refused)
                | (PostChecked, Delivered)
        )
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryStage::Received => "received",
            QueryStage::PreChecked => "pre_checked",
            QueryStage::Escalated => "escalated",
            QueryStage::Routed => "routed",
            QueryStage::Merged => "merged",
            QueryStage::PostChecked => "post_checked",
            QueryStage::Refused => "refused",
            QueryStage::Delivered => "delivered",
            QueryStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks the stages a query has passed through.
#[derive(Debug, Clone)]
pub struct QueryLifecycle {
    query_id: Uuid,
    stage: QueryStage,
    transitions: Vec<(QueryStage, DateTime<Utc>)>,
}

impl QueryLifecycle {
    pub fn new(query_id: Uuid) -> Self {
        Self {
            query_id,
            stage: QueryStage::Received,
            transitions: vec![(QueryStage::Received, Utc::now())],
        }
    }

    pub fn stage(&self) -> QueryStage {
        self.stage
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    /// Stages visited so far, in order.
    pub fn path(&self) -> Vec<QueryStage> {
        self.transitions.iter().map(|(s, _)| *s).collect()
    }

    pub fn advance(&mut self, next: QueryStage) -> Result<(), PipelineError> {
        if !self.stage.can_transition_to(next) {
            return Err(PipelineError::InvalidStateTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        self.stage = next;
        self.transitions.push((next, Utc::now()));
        Ok(())
    }
}

// =============================================================================
// Audit log
// =============================================================================

/// An entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub query_id: Uuid,
    pub event: AuditEvent,
}

/// Types of events that can be audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Escalated { matched: Vec<String> },
    Rewritten { rules: Vec<String>, segments: usize },
    Refused { rule: String },
    Delivered { from_cache: bool },
}

// =============================================================================
// Filter
// =============================================================================

struct PatternRule {
    name: String,
    regex: Regex,
}

fn compile(name: &str, pattern: &str) -> Result<PatternRule, ConfigError> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| ConfigError::Invalid {
            message: format!("safety pattern '{name}' does not compile: {e}"),
        })?;
    Ok(PatternRule {
        name: name.to_string(),
        regex,
    })
}

/// Pattern for a configured escalation term: the normalized words with
/// common inflections allowed on the last one ("choke" also matches
/// "choking").
fn term_pattern(term: &str) -> String {
    let normalized = normalize_for_matching(term);
    let mut words: Vec<&str> = normalized.split_whitespace().collect();
    let Some(last) = words.pop() else {
        return String::new();
    };
    let mut pattern = String::from(r"\b");
    for word in words {
        pattern.push_str(&regex::escape(word));
        pattern.push(' ');
    }
    match last.strip_suffix('e') {
        Some(stem) if stem.chars().count() > 1 => {
            pattern.push_str(&regex::escape(stem));
            pattern.push_str(r"(?:e|es|ed|ing)");
        }
        _ => {
            pattern.push_str(&regex::escape(last));
            pattern.push_str(r"(?:s|es|ed|ing)?");
        }
    }
    pattern.push_str(r"\b");
    pattern
}

/// Inbound and outbound safety policy.
pub struct SafetyFilter {
    escalation_rules: Vec<PatternRule>,
    rewrite_rules: Vec<PatternRule>,
    refuse_rules: Vec<PatternRule>,
    sentence: Regex,
    clause: Regex,
    audit_log: Mutex<VecDeque<AuditEntry>>,
    max_audit_entries: usize,
}

impl SafetyFilter {
    pub fn new(config: &SafetyConfig) -> Result<Self, ConfigError> {
        let mut escalation_rules = Vec::new();
        for (term, pattern) in ESCALATION_PATTERNS {
            escalation_rules.push(compile(term, pattern)?);
        }
        for term in &config.extra_escalation_terms {
            if normalize_for_matching(term).trim().is_empty() {
                continue;
            }
            escalation_rules.push(compile(term.trim(), &term_pattern(term))?);
        }

        let mut rewrite_rules = Vec::new();
        for (name, pattern) in rewrite_patterns() {
            rewrite_rules.push(compile(name, &pattern)?);
        }
        for (i, pattern) in config.extra_rewrite_patterns.iter().enumerate() {
            rewrite_rules.push(compile(&format!("custom_rewrite_{i}"), pattern)?);
        }

        let mut refuse_rules = Vec::new();
        for (name, pattern) in REFUSE_RULES {
            refuse_rules.push(compile(name, pattern)?);
        }
        for (i, pattern) in config.extra_refusal_patterns.iter().enumerate() {
            refuse_rules.push(compile(&format!("custom_refusal_{i}"), pattern)?);
        }

        let sentence = Regex::new(r"[^.!?\n]+[.!?]*").map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })?;
        let clause = compile("clause_boundary", CLAUSE_BOUNDARY)?.regex;

        Ok(Self {
            escalation_rules,
            rewrite_rules,
            refuse_rules,
            sentence,
            clause,
            audit_log: Mutex::new(VecDeque::new()),
            max_audit_entries: config.max_audit_entries,
        })
    }

    /// Escalation terms present in `text` in any of their inflected forms,
    /// matched on word boundaries.
    pub fn escalation_matches(&self, text: &str) -> Vec<String> {
        let normalized = normalize_for_matching(text);
        self.escalation_rules
            .iter()
            .filter(|rule| rule.regex.is_match(&normalized))
            .map(|rule| rule.name.clone())
            .collect()
    }

    /// Inbound check. `Err` carries the fixed emergency response.
    pub fn pre_check(&self, query: &Query) -> Result<(), EscalationResponse> {
        let matched = self.escalation_matches(&query.text);
        if matched.is_empty() {
            return Ok(());
        }
        warn!(query_id = %query.id, matched = ?matched, "Escalation triggered by pre-check");
        self.log_event(query.id, AuditEvent::Escalated {
            matched: matched.clone(),
        });
        Err(EscalationResponse {
            text: EMERGENCY_TEMPLATE.to_string(),
            matched,
        })
    }

    /// Name of the first refuse-tier rule that fires. A match is skipped
    /// only when a negation in its own clause governs it.
    pub fn refusal_rule(&self, text: &str) -> Option<String> {
        for sentence in self.sentence.find_iter(text) {
            for clause in self.clause.split(sentence.as_str()) {
                for rule in &self.refuse_rules {
                    if rule
                        .regex
                        .find_iter(clause)
                        .any(|m| !is_negated(&clause[..m.start()]))
                    {
                        return Some(rule.name.clone());
                    }
                }
            }
        }
        None
    }

    /// Replace diagnostic sentences with the safe completion. Returns the new
    /// text and the names of the rules that fired.
    pub fn rewrite(&self, text: &str) -> (String, Vec<String>) {
        let mut fired: Vec<String> = Vec::new();
        let rewritten = self
            .sentence
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let sentence = &caps[0];
                let asserted = |rule: &&PatternRule| {
                    rule.regex
                        .find_iter(sentence)
                        .any(|m| !is_conditional(&sentence[..m.start()]))
                };
                match self.rewrite_rules.iter().find(asserted) {
                    Some(rule) => {
                        if !fired.contains(&rule.name) {
                            fired.push(rule.name.clone());
                        }
                        let lead = &sentence[..sentence.len() - sentence.trim_start().len()];
                        format!("{lead}{SAFE_COMPLETION}")
                    }
                    None => sentence.to_string(),
                }
            })
            .into_owned();
        (rewritten, fired)
    }

    /// Outbound check on a merged answer. `Err` carries the fixed refusal.
    pub fn post_check(
        &self,
        query: &Query,
        mut answer: MergedAnswer,
    ) -> Result<MergedAnswer, RefusalResponse> {
        let body = strip_disclaimer(&answer.text);
        if let Some(rule) = self.refusal_rule(&body) {
            warn!(query_id = %query.id, rule = %rule, "Answer refused by post-check");
            self.log_event(query.id, AuditEvent::Refused { rule: rule.clone() });
            return Err(RefusalResponse {
                text: REFUSAL_MESSAGE.to_string(),
                rule,
            });
        }

        let mut rules: Vec<String> = Vec::new();
        let mut segments_rewritten = 0;
        for segment in &mut answer.segments {
            let (text, fired) = self.rewrite(&segment.text);
            if !fired.is_empty() {
                segments_rewritten += 1;
                segment.text = text;
                for r in fired {
                    if !rules.contains(&r) {
                        rules.push(r);
                    }
                }
            }
        }
        let (text, fired) = self.rewrite(&body);
        for r in fired {
            if !rules.contains(&r) {
                rules.push(r);
            }
        }

        if !rules.is_empty() {
            info!(
                query_id = %query.id,
                rules = ?rules,
                segments = segments_rewritten,
                "Diagnostic claims rewritten"
            );
            self.log_event(query.id, AuditEvent::Rewritten {
                rules,
                segments: segments_rewritten,
            });
        }

        answer.text = ensure_disclaimer(&text);
        answer.metadata.rewritten_segments += segments_rewritten;
        Ok(answer)
    }

    pub fn record_delivery(&self, query_id: Uuid, from_cache: bool) {
        self.log_event(query_id, AuditEvent::Delivered { from_cache });
    }

    fn log_event(&self, query_id: Uuid, event: AuditEvent) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            query_id,
            event,
        };
        if let Ok(mut log) = self.audit_log.lock() {
            log.push_back(entry);
            while log.len() > self.max_audit_entries {
                log.pop_front();
            }
        }
    }

    /// Snapshot of the audit log, oldest first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit_log
            .lock()
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Whether the words right before an instruction negate it. Only fillers
/// may sit between the negation and the instruction.
fn is_negated(prefix: &str) -> bool {
    for word in normalize_for_matching(prefix)
        .split_whitespace()
        .rev()
        .take(NEGATION_SCOPE)
    {
        if NEGATIONS.contains(&word) {
            return true;
        }
        if !NEGATION_FILLERS.contains(&word) {
            return false;
        }
    }
    false
}

fn is_conditional(prefix: &str) -> bool {
    normalize_for_matching(prefix)
        .split_whitespace()
        .next_back()
        .is_some_and(|word| CONDITIONALS.contains(&word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnswerMetadata, AnswerSegment, CapabilityTag};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn filter() -> SafetyFilter {
        SafetyFilter::new(&SafetyConfig::default()).unwrap()
    }

    fn answer(segments: &[(CapabilityTag, &str)]) -> MergedAnswer {
        let segments: Vec<AnswerSegment> = segments
            .iter()
            .map(|(tag, text)| AnswerSegment {
                capability: *tag,
                agent_id: tag.as_str().into(),
                text: text.to_string(),
            })
            .collect();
        MergedAnswer {
            text: segments.iter().map(|s| s.text.clone()).collect::<Vec<_>>().join("\n\n"),
            segments,
            citations: Vec::new(),
            contributing_agents: BTreeSet::new(),
            metadata: AnswerMetadata::default(),
        }
    }

    #[test]
    fn test_escalation_word_boundary_and_apostrophes() {
        let f = filter();
        assert_eq!(
            f.escalation_matches("I have chest pain and I can’t breathe"),
            vec!["chest pain", "can't breathe"]
        );
        assert!(f.escalation_matches("she stroked the cat").is_empty());
        assert!(f.escalation_matches("my seizure medication ran out").contains(&"seizure".to_string()));
        assert!(f.escalation_matches("CHEST PAIN!!").contains(&"chest pain".to_string()));
    }

    #[test]
    fn test_pre_check_returns_template() {
        let f = filter();
        let q = Query::new("I think I took an overdose", "u1", "c1");
        let escalation = f.pre_check(&q).unwrap_err();
        assert_eq!(escalation.text, EMERGENCY_TEMPLATE);
        assert_eq!(escalation.matched, vec!["overdose"]);
        assert!(matches!(
            f.audit_log()[0].event,
            AuditEvent::Escalated { .. }
        ));
        assert!(f.pre_check(&Query::new("what is fever", "u1", "c1")).is_ok());
    }

    #[test]
    fn test_escalation_matches_inflected_forms() {
        let f = filter();
        assert_eq!(f.escalation_matches("my son is having seizures right now"), vec!["seizure"]);
        assert_eq!(f.escalation_matches("I think she is overdosing on insulin"), vec!["overdose"]);
        assert_eq!(f.escalation_matches("he overdosed"), vec!["overdose"]);
        assert_eq!(f.escalation_matches("signs of strokes in older adults"), vec!["stroke"]);
        assert_eq!(f.escalation_matches("my dad stopped breathing"), vec!["not breathing"]);
        assert_eq!(f.escalation_matches("I'm unable to breathe"), vec!["can't breathe"]);
        assert!(f.escalation_matches("how do I prevent a cold").is_empty());
    }

    #[test]
    fn test_extra_escalation_terms() {
        let f = SafetyFilter::new(&SafetyConfig {
            extra_escalation_terms: vec!["anaphylaxis".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(f.escalation_matches("signs of Anaphylaxis?"), vec!["anaphylaxis"]);

        let f = SafetyFilter::new(&SafetyConfig {
            extra_escalation_terms: vec!["choke".into(), "  ".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(f.escalation_matches("the baby is choking"), vec!["choke"]);
        assert!(f.escalation_matches("artichoke soup").is_empty());
    }

    #[test]
    fn test_invalid_extra_pattern_rejected() {
        let result = SafetyFilter::new(&SafetyConfig {
            extra_refusal_patterns: vec!["(unclosed".into()],
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_ensure_disclaimer_idempotent() {
        let once = ensure_disclaimer("Fever is a raised body temperature.");
        let twice = ensure_disclaimer(&once);
        assert_eq!(once, twice);
        assert_eq!(once.matches(DISCLAIMER).count(), 1);
        assert_eq!(ensure_disclaimer(""), DISCLAIMER);
    }

    #[test]
    fn test_ensure_disclaimer_collapses_duplicates() {
        let text = format!("Body.\n\n{DISCLAIMER}\n\n{DISCLAIMER}");
        assert_eq!(ensure_disclaimer(&text), format!("Body.\n\n{DISCLAIMER}"));
    }

    #[test]
    fn test_rewrite_diagnostic_sentence() {
        let f = filter();
        let (text, fired) =
            f.rewrite("Thanks for the details. You most likely have a thyroid disorder. Rest well.");
        assert_eq!(
            text,
            format!("Thanks for the details. {SAFE_COMPLETION} Rest well.")
        );
        assert_eq!(fired, vec!["you_have_condition"]);
    }

    #[test]
    fn test_rewrite_common_diagnostic_phrasings() {
        let f = filter();
        let cases = [
            ("Based on your symptoms, you have pneumonia.", "you_have_condition"),
            ("You've got bronchitis.", "you_have_condition"),
            ("You are diabetic.", "you_are_condition"),
            ("You're probably anaemic.", "you_are_condition"),
            ("This is definitely appendicitis.", "this_is_condition"),
            ("It sounds like a sinus infection.", "this_is_condition"),
            ("You were diagnosed with asthma, so carry your inhaler.", "diagnosed_with"),
        ];
        for (text, rule) in cases {
            let (rewritten, fired) = f.rewrite(text);
            assert_eq!(fired, vec![rule], "{text}");
            assert_eq!(rewritten, SAFE_COMPLETION, "{text}");
        }
    }

    #[test]
    fn test_rewrite_leaves_conditional_and_general_statements() {
        let f = filter();
        for text in [
            "If you have diabetes, choose whole fruit over juice.",
            "People with hypertension should limit salt.",
            "It is a good idea to rest.",
            "You have to take it with food.",
        ] {
            let (rewritten, fired) = f.rewrite(text);
            assert!(fired.is_empty(), "{text}");
            assert_eq!(rewritten, text);
        }
    }

    #[test]
    fn test_refusal_ignores_negated_instruction() {
        let f = filter();
        assert_eq!(
            f.refusal_rule("Do not stop taking your medication without asking your doctor."),
            None
        );
        assert_eq!(
            f.refusal_rule("You should stop taking your metformin tablets."),
            Some("stop_medication".into())
        );
        assert_eq!(
            f.refusal_rule("Never double the dose. You can double your dose tonight."),
            Some("change_dose".into())
        );
        assert_eq!(f.refusal_rule("You should never stop taking insulin."), None);
        assert_eq!(f.refusal_rule("Don't ever skip your dose."), None);
        assert_eq!(f.refusal_rule("It is not safe to stop taking your medication."), None);
    }

    #[test]
    fn test_refusal_negation_is_clause_scoped() {
        let f = filter();
        let refused = [
            ("If your sugar does not improve, double your dose.", "change_dose"),
            ("If the cough does not settle, stop taking your medication.", "stop_medication"),
            ("No, you should increase your insulin dose tonight.", "change_dose"),
            ("Without delay, stop taking your tablets.", "stop_medication"),
            ("If it does not help stop taking the tablets", "stop_medication"),
            ("Do not worry but double your dose tomorrow.", "change_dose"),
        ];
        for (text, rule) in refused {
            assert_eq!(f.refusal_rule(text), Some(rule.to_string()), "{text}");
        }
    }

    #[test]
    fn test_post_check_refuses() {
        let f = filter();
        let q = Query::new("q", "u1", "c1");
        let refusal = f
            .post_check(&q, answer(&[(CapabilityTag::DrugInfo, "Increase your insulin dose by 10 units.")]))
            .unwrap_err();
        assert_eq!(refusal.text, REFUSAL_MESSAGE);
        assert_eq!(refusal.rule, "change_dose");
    }

    #[test]
    fn test_post_check_rewrites_and_appends_disclaimer() {
        let f = filter();
        let q = Query::new("q", "u1", "c1");
        let checked = f
            .post_check(
                &q,
                answer(&[
                    (CapabilityTag::Qa, "You probably have an ear infection."),
                    (CapabilityTag::DrugInfo, "Amoxicillin is an antibiotic."),
                ]),
            )
            .unwrap();
        assert_eq!(checked.metadata.rewritten_segments, 1);
        assert_eq!(checked.segments[0].text, SAFE_COMPLETION);
        assert!(checked.text.starts_with(SAFE_COMPLETION));
        assert_eq!(checked.text.matches(DISCLAIMER).count(), 1);

        // Filtering an already filtered answer keeps exactly one disclaimer.
        let again = f.post_check(&q, checked.clone()).unwrap();
        assert_eq!(again.text, checked.text);
    }

    #[test]
    fn test_lifecycle_valid_paths() {
        let mut lc = QueryLifecycle::new(Uuid::new_v4());
        for stage in [
            QueryStage::PreChecked,
            QueryStage::Routed,
            QueryStage::Merged,
            QueryStage::PostChecked,
            QueryStage::Delivered,
        ] {
            lc.advance(stage).unwrap();
        }
        assert!(lc.stage().is_terminal());
        assert_eq!(lc.path().len(), 6);

        let mut cached = QueryLifecycle::new(Uuid::new_v4());
        cached.advance(QueryStage::PreChecked).unwrap();
        cached.advance(QueryStage::Routed).unwrap();
        cached.advance(QueryStage::Delivered).unwrap();
    }

    #[test]
    fn test_lifecycle_rejects_illegal_transition() {
        let mut lc = QueryLifecycle::new(Uuid::new_v4());
        let err = lc.advance(QueryStage::Delivered).unwrap_err();
        assert_eq!(
            err,
            PipelineError::InvalidStateTransition {
                from: "received".into(),
                to: "delivered".into()
            }
        );
        lc.advance(QueryStage::PreChecked).unwrap();
        lc.advance(QueryStage::Escalated).unwrap();
        assert!(lc.advance(QueryStage::Routed).is_err());
    }

    #[test]
    fn test_audit_log_bounded() {
        let f = SafetyFilter::new(&SafetyConfig {
            max_audit_entries: 2,
            ..Default::default()
        })
        .unwrap();
        for _ in 0..5 {
            f.record_delivery(Uuid::new_v4(), false);
        }
        assert_eq!(f.audit_log().len(), 2);
    }
}
