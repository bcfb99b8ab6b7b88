//! Deterministic `EmbeddingService`/`LlmService` stand-ins for driving the
//! pipeline without a real model: embeddings are keyed off a handful of
//! known phrases, and the LLM inspects which system prompt it was given to
//! decide whether it's being asked for entities, facts, temporal cues, or a
//! contradiction verdict.

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::services::{ChatMessage, ChatRole, EmbeddingService, LlmService},
};

pub struct FixedEmbedding;

#[async_trait]
impl EmbeddingService for FixedEmbedding {
    async fn text_to_vector(&self, text: &str) -> Result<Vec<f32>, AppError> {
        Ok(hash_embedding(text))
    }

    async fn texts_to_vectors(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(texts.iter().map(|t| hash_embedding(t)).collect())
    }

    async fn initialize(&self) -> Result<(), AppError> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn dimensions(&self) -> u32 {
        8
    }
}

/// A cheap stand-in for a real embedding model: buckets characters into 8
/// dimensions so that similar strings (shared letters) land close together
/// under cosine similarity, without pulling in an actual model.
fn hash_embedding(text: &str) -> Vec<f32> {
    let mut buckets = [0.0f32; 8];
    for byte in text.to_lowercase().bytes() {
        buckets[(byte as usize) % 8] += 1.0;
    }
    let norm: f32 = buckets.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for bucket in &mut buckets {
            *bucket /= norm;
        }
    }
    buckets.to_vec()
}

pub struct ScriptedLlm;

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn chat_completions(&self, messages: Vec<ChatMessage>) -> Result<String, AppError> {
        let system = messages
            .iter()
            .find(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let user = messages
            .iter()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        if system.contains("named entities") {
            return Ok(entities_for(user));
        }
        if system.contains("factual relationships") {
            return Ok(facts_for(user));
        }
        if system.contains("temporal cue") {
            return Ok(temporal_for(user));
        }
        if system.contains("contradicts") {
            return Ok(contradiction_for(user));
        }
        Ok("{}".to_string())
    }

    async fn serve_for(&self, _service_name: &str, _model_id: &str) -> Result<(), AppError> {
        Ok(())
    }

    async fn unload_for(&self, _service_name: &str) -> Result<(), AppError> {
        Ok(())
    }

    fn models(&self) -> Vec<String> {
        vec!["scripted".to_string()]
    }

    async fn set_current_model(&self, _model_id: &str) -> Result<(), AppError> {
        Ok(())
    }

    fn on_current_model_change(&self) -> tokio::sync::watch::Receiver<String> {
        tokio::sync::watch::channel(String::new()).1
    }
}

fn entities_for(chunk: &str) -> String {
    let mut entities = Vec::new();
    if chunk.contains("AlphaCorp") {
        entities.push(r#"{"name": "AlphaCorp", "node_type": "organization", "summary": null}"#);
    }
    if chunk.contains("BetaInc") {
        entities.push(r#"{"name": "BetaInc", "node_type": "organization", "summary": null}"#);
    }
    format!(r#"{{"entities": [{}]}}"#, entities.join(", "))
}

fn facts_for(chunk: &str) -> String {
    if !(chunk.contains("AlphaCorp") && chunk.contains("BetaInc")) {
        return r#"{"facts": []}"#.to_string();
    }
    if chunk.contains("cancel") {
        return r#"{"facts": [{"subject": "AlphaCorp", "object": "BetaInc", "edge_type": "cancels_acquisition", "fact_text": "AlphaCorp's acquisition of BetaInc was cancelled"}]}"#.to_string();
    }
    if chunk.contains("acquire") {
        return r#"{"facts": [{"subject": "AlphaCorp", "object": "BetaInc", "edge_type": "acquires", "fact_text": "AlphaCorp acquires BetaInc"}]}"#.to_string();
    }
    r#"{"facts": []}"#.to_string()
}

/// The scripted fact builders above never embed an explicit date, so this
/// always reports no cue and leaves the pipeline's reference timestamp as
/// the fact's `valid_at`.
fn temporal_for(_user_message: &str) -> String {
    r#"{"assignments": []}"#.to_string()
}

fn contradiction_for(user_message: &str) -> String {
    let contradicts = user_message.contains("cancel");
    format!(r#"{{"contradicts": {contradicts}}}"#)
}
