use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::sync::RwLock;
use tracing::debug;

use crate::error::AppError;

/// Narrow contract the ingestion and retrieval pipelines depend on for
/// turning text into vectors. Implemented directly against `async-openai`
/// in host mode, or over RPC by a proxy adapter in client mode — both sides
/// of the split described for the embedding service.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn text_to_vector(&self, text: &str) -> Result<Vec<f32>, AppError>;
    async fn texts_to_vectors(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
    async fn initialize(&self) -> Result<(), AppError>;
    fn is_ready(&self) -> bool;
    fn dimensions(&self) -> u32;
}

/// Narrow contract for chat completion and model lifecycle management,
/// mirrored by a proxy adapter in client mode.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn chat_completions(&self, messages: Vec<ChatMessage>) -> Result<String, AppError>;
    async fn serve_for(&self, service_name: &str, model_id: &str) -> Result<(), AppError>;
    async fn unload_for(&self, service_name: &str) -> Result<(), AppError>;
    fn models(&self) -> Vec<String>;
    async fn set_current_model(&self, model_id: &str) -> Result<(), AppError>;
    fn on_current_model_change(&self) -> tokio::sync::watch::Receiver<String>;
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// `EmbeddingService` backed directly by OpenAI's embeddings API, the host
/// process's "default" named instance.
pub struct OpenAiEmbeddingService {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: u32,
    ready: RwLock<bool>,
}

impl OpenAiEmbeddingService {
    pub fn new(client: Client<OpenAIConfig>, model: String, dimensions: u32) -> Self {
        Self {
            client,
            model,
            dimensions,
            ready: RwLock::new(false),
        }
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddingService {
    async fn text_to_vector(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .dimensions(self.dimensions)
            .input([text])
            .build()?;

        let response = self.client.embeddings().create(request).await?;
        let embedding = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AppError::LLMParsing("no embedding data received".into()))?
            .embedding;

        debug!(dimensions = embedding.len(), "generated embedding");
        Ok(embedding)
    }

    async fn texts_to_vectors(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .dimensions(self.dimensions)
            .input(texts.to_vec())
            .build()?;

        let response = self.client.embeddings().create(request).await?;
        let mut rows = response.data;
        rows.sort_by_key(|row| row.index);
        Ok(rows.into_iter().map(|row| row.embedding).collect())
    }

    async fn initialize(&self) -> Result<(), AppError> {
        *self.ready.write().expect("embedding readiness lock poisoned") = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        *self.ready.read().expect("embedding readiness lock poisoned")
    }

    fn dimensions(&self) -> u32 {
        self.dimensions
    }
}

/// `LlmService` backed directly by OpenAI's chat completions API.
pub struct OpenAiLlmService {
    client: Client<OpenAIConfig>,
    current_model: RwLock<String>,
    model_change: tokio::sync::watch::Sender<String>,
}

impl OpenAiLlmService {
    pub fn new(client: Client<OpenAIConfig>, default_model: String) -> Self {
        let (model_change, _) = tokio::sync::watch::channel(default_model.clone());
        Self {
            client,
            current_model: RwLock::new(default_model),
            model_change,
        }
    }

    fn current_model_name(&self) -> String {
        self.current_model
            .read()
            .expect("current model lock poisoned")
            .clone()
    }

    fn set_model(&self, model_id: &str) {
        *self
            .current_model
            .write()
            .expect("current model lock poisoned") = model_id.to_string();
        let _ = self.model_change.send(model_id.to_string());
    }
}

#[async_trait]
impl LlmService for OpenAiLlmService {
    async fn chat_completions(&self, messages: Vec<ChatMessage>) -> Result<String, AppError> {
        let openai_messages: Vec<ChatCompletionRequestMessage> = messages
            .into_iter()
            .map(|message| match message.role {
                ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(message.content)
                    .build()
                    .map(Into::into),
                ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(message.content)
                    .build()
                    .map(Into::into),
                ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(message.content)
                    .build()
                    .map(Into::into),
            })
            .collect::<Result<_, _>>()?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(self.current_model_name())
            .messages(openai_messages)
            .temperature(0.0)
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::LLMParsing("no completion choices returned".into()))?;

        Ok(content)
    }

    async fn serve_for(&self, _service_name: &str, model_id: &str) -> Result<(), AppError> {
        self.set_model(model_id);
        Ok(())
    }

    async fn unload_for(&self, _service_name: &str) -> Result<(), AppError> {
        Ok(())
    }

    fn models(&self) -> Vec<String> {
        vec![self.current_model_name()]
    }

    async fn set_current_model(&self, model_id: &str) -> Result<(), AppError> {
        self.set_model(model_id);
        Ok(())
    }

    fn on_current_model_change(&self) -> tokio::sync::watch::Receiver<String> {
        self.model_change.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_role_equality() {
        assert_eq!(ChatRole::User, ChatRole::User);
        assert_ne!(ChatRole::User, ChatRole::Assistant);
    }

    #[tokio::test]
    async fn serve_for_notifies_model_change_subscribers() {
        let client = Client::with_config(OpenAIConfig::new().with_api_key("test-key"));
        let llm = OpenAiLlmService::new(client, "gpt-4o-mini".to_string());
        let mut rx = llm.on_current_model_change();

        llm.serve_for("default", "gpt-4o").await.expect("serve_for");
        rx.changed().await.expect("channel open");
        assert_eq!(*rx.borrow(), "gpt-4o");
        assert_eq!(llm.models(), vec!["gpt-4o".to_string()]);
    }
}
