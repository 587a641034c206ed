//! System prompts for the model-backed capability agents.

use crate::types::CapabilityTag;

const SHARED_RULES: &str = "\
Rules you must always follow:
1. Do not diagnose. Never tell the user which condition they have.
2. Do not prescribe. Never tell the user which medicine to start.
3. Do not alter prescriptions. Never suggest stopping, skipping or changing a dose.
4. Base your answer on the numbered sources provided. Say so when they do not cover the question.
5. Recommend a qualified healthcare professional for anything specific to the user.
6. Do not add a medical disclaimer; one is appended automatically.";

const QA_PROMPT: &str = "\
You answer general health questions about conditions, symptoms, nutrition and lifestyle.
Explain medical terms in plain language and keep answers short, clear and friendly.";

const DRUG_INFO_PROMPT: &str = "\
You provide factual medicine information: what a medicine is used for, how it is usually taken,
common and serious side effects, interactions with other medicines and food, and precautions.
Mention generic and brand names where the sources give them. Stick to the sources.";

const DOCUMENT_PROMPT: &str = "\
You summarize the user's own medical documents, such as prescriptions and lab reports.
List the medicines, instructions and findings the documents contain and explain them simply.
Never reinterpret results as a diagnosis.";

const IMAGE_PROMPT: &str = "\
You describe what is visible in a medical image the user attached, in cautious general terms.
Point out that images need professional interpretation and never name a condition as certain.";

/// Full system prompt for an agent of the given capability.
pub fn system_prompt(tag: CapabilityTag) -> String {
    let role = match tag {
        CapabilityTag::Qa => QA_PROMPT,
        CapabilityTag::DrugInfo => DRUG_INFO_PROMPT,
        CapabilityTag::Document => DOCUMENT_PROMPT,
        CapabilityTag::Image => IMAGE_PROMPT,
    };
    format!("{role}\n\n{SHARED_RULES}")
}

/// User turn carrying the grounding context and the question.
pub fn user_prompt(question: &str, context: &str) -> String {
    if context.is_empty() {
        format!(
            "No reference sources are available for this question. Answer only with widely \
             accepted general information and say that it could not be checked against sources.\n\n\
             Question: {question}"
        )
    } else {
        format!("Sources:\n{context}\n\nQuestion: {question}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_prompt_carries_shared_rules() {
        for tag in CapabilityTag::all() {
            let prompt = system_prompt(*tag);
            assert!(prompt.contains("Do not diagnose"));
            assert!(prompt.contains("Do not alter prescriptions"));
        }
    }

    #[test]
    fn test_user_prompt_ungrounded() {
        let p = user_prompt("What is fever?", "");
        assert!(p.contains("No reference sources"));
        assert!(p.ends_with("Question: What is fever?"));
    }

    #[test]
    fn test_user_prompt_grounded() {
        let p = user_prompt("What is fever?", "[Source 1] (Relevance: 0.90)\nFever is...");
        assert!(p.starts_with("Sources:\n[Source 1]"));
    }
}
