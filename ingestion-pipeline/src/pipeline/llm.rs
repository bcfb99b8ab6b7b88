//! Prompt construction and defensive JSON parsing for the extraction
//! stages. An LLM response is never trusted to be bare JSON: it is
//! stripped of Markdown code fences first, and a parse failure yields an
//! empty result for that chunk rather than failing the job outright.

use chrono::{DateTime, Utc};
use common::{error::AppError, utils::services::{ChatMessage, ChatRole, LlmService}};
use serde::Deserialize;
use tracing::warn;

const ENTITY_SYSTEM_MESSAGE: &str = "You extract named entities from text. \
Respond with only a JSON object of the form \
{\"entities\": [{\"name\": str, \"node_type\": str, \"summary\": str|null}]}. \
No prose, no code fences.";

const FACT_SYSTEM_MESSAGE: &str = "You extract factual relationships between \
named entities already identified in the text. Respond with only a JSON \
object of the form {\"facts\": [{\"subject\": str, \"object\": str, \
\"edge_type\": str, \"fact_text\": str}]}, where subject and object are \
drawn from the provided entity list. No prose, no code fences.";

const TEMPORAL_SYSTEM_MESSAGE: &str = "For each numbered fact, decide \
whether the text gives a temporal cue (e.g. \"since 2019\", \"until last \
month\") relative to the reference timestamp provided. Respond with only a \
JSON object {\"assignments\": [{\"index\": int, \"valid_at\": str|null, \
\"invalid_at\": str|null}]} using RFC3339 timestamps. Omit an assignment \
(or use null) when no cue exists.";

const CONTRADICTION_SYSTEM_MESSAGE: &str = "Two statements describe the \
same pair of entities and relationship type. Decide whether the new \
statement contradicts (supersedes) the existing one, as opposed to merely \
restating or extending it. Respond with only {\"contradicts\": bool}.";

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub node_type: String,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedFact {
    pub subject: String,
    pub object: String,
    pub edge_type: String,
    pub fact_text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemporalAssignment {
    pub index: usize,
    pub valid_at: Option<DateTime<Utc>>,
    pub invalid_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct EntityEnvelope {
    entities: Vec<ExtractedEntity>,
}

#[derive(Deserialize)]
struct FactEnvelope {
    facts: Vec<ExtractedFact>,
}

#[derive(Deserialize)]
struct TemporalEnvelope {
    assignments: Vec<TemporalAssignment>,
}

#[derive(Deserialize)]
struct ContradictionEnvelope {
    contradicts: bool,
}

/// Strips a leading/trailing ```` ```json ```` or ```` ``` ```` fence, if
/// present, so a model that ignores "no code fences" still parses.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub async fn extract_entities_chunk(
    llm: &dyn LlmService,
    chunk: &str,
) -> Vec<ExtractedEntity> {
    let messages = vec![
        ChatMessage {
            role: ChatRole::System,
            content: ENTITY_SYSTEM_MESSAGE.to_string(),
        },
        ChatMessage {
            role: ChatRole::User,
            content: chunk.to_string(),
        },
    ];

    match llm.chat_completions(messages).await {
        Ok(raw) => match serde_json::from_str::<EntityEnvelope>(strip_code_fence(&raw)) {
            Ok(envelope) => envelope.entities,
            Err(err) => {
                warn!(error = %err, "entity extraction chunk failed to parse; contributing no entities");
                Vec::new()
            }
        },
        Err(err) => {
            warn!(error = %err, "entity extraction LLM call failed; contributing no entities");
            Vec::new()
        }
    }
}

pub async fn extract_facts_chunk(
    llm: &dyn LlmService,
    chunk: &str,
    known_entities: &[String],
) -> Vec<ExtractedFact> {
    let entity_list = known_entities.join(", ");
    let user_message = format!("Known entities: {entity_list}\n\nText:\n{chunk}");

    let messages = vec![
        ChatMessage {
            role: ChatRole::System,
            content: FACT_SYSTEM_MESSAGE.to_string(),
        },
        ChatMessage {
            role: ChatRole::User,
            content: user_message,
        },
    ];

    match llm.chat_completions(messages).await {
        Ok(raw) => match serde_json::from_str::<FactEnvelope>(strip_code_fence(&raw)) {
            Ok(envelope) => envelope.facts,
            Err(err) => {
                warn!(error = %err, "fact extraction chunk failed to parse; contributing no facts");
                Vec::new()
            }
        },
        Err(err) => {
            warn!(error = %err, "fact extraction LLM call failed; contributing no facts");
            Vec::new()
        }
    }
}

pub async fn assign_temporal(
    llm: &dyn LlmService,
    reference_timestamp: DateTime<Utc>,
    facts: &[ExtractedFact],
) -> Vec<TemporalAssignment> {
    if facts.is_empty() {
        return Vec::new();
    }

    let numbered = facts
        .iter()
        .enumerate()
        .map(|(i, fact)| format!("{i}. {}", fact.fact_text))
        .collect::<Vec<_>>()
        .join("\n");
    let user_message = format!("Reference timestamp: {reference_timestamp}\n\nFacts:\n{numbered}");

    let messages = vec![
        ChatMessage {
            role: ChatRole::System,
            content: TEMPORAL_SYSTEM_MESSAGE.to_string(),
        },
        ChatMessage {
            role: ChatRole::User,
            content: user_message,
        },
    ];

    match llm.chat_completions(messages).await {
        Ok(raw) => match serde_json::from_str::<TemporalEnvelope>(strip_code_fence(&raw)) {
            Ok(envelope) => envelope.assignments,
            Err(err) => {
                warn!(error = %err, "temporal assignment failed to parse; defaulting all facts");
                Vec::new()
            }
        },
        Err(err) => {
            warn!(error = %err, "temporal assignment LLM call failed; defaulting all facts");
            Vec::new()
        }
    }
}

/// Judges whether `new_text` contradicts (rather than restates) `existing_text`.
pub async fn judges_contradiction(
    llm: &dyn LlmService,
    existing_text: &str,
    new_text: &str,
) -> bool {
    let messages = vec![
        ChatMessage {
            role: ChatRole::System,
            content: CONTRADICTION_SYSTEM_MESSAGE.to_string(),
        },
        ChatMessage {
            role: ChatRole::User,
            content: format!("Existing: {existing_text}\nNew: {new_text}"),
        },
    ];

    match llm.chat_completions(messages).await {
        Ok(raw) => serde_json::from_str::<ContradictionEnvelope>(strip_code_fence(&raw))
            .map(|envelope| envelope.contradicts)
            .unwrap_or(false),
        Err(err) => {
            warn!(error = %err, "contradiction judge call failed; treating as re-assertion");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fence_removes_json_fence() {
        let fenced = "```json\n{\"entities\": []}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"entities\": []}");
    }

    #[test]
    fn strip_code_fence_is_noop_on_bare_json() {
        assert_eq!(strip_code_fence("{\"entities\": []}"), "{\"entities\": []}");
    }

    #[test]
    fn entity_envelope_parses_minimal_shape() {
        let raw = r#"{"entities": [{"name": "Ada", "node_type": "person", "summary": null}]}"#;
        let envelope: EntityEnvelope = serde_json::from_str(raw).expect("parses");
        assert_eq!(envelope.entities.len(), 1);
        assert_eq!(envelope.entities[0].name, "Ada");
    }
}
