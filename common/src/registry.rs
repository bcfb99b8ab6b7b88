use std::sync::Arc;

use async_openai::{config::OpenAIConfig, Client};
use tokio::sync::{watch, RwLock};

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::{
        config::AppConfig,
        services::{EmbeddingService, LlmService, OpenAiEmbeddingService, OpenAiLlmService},
    },
};

/// Which side of the host/client split a process is running as. Decided
/// once at construction, never an ambient global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Owns the embedded database directly.
    Host,
    /// Talks to a host's database and model services over the RPC layer.
    /// The proxy-side registry and its `DbProxy`/embedding/LLM adapters
    /// live in the `rpc` crate, which depends on `common` rather than the
    /// other way around.
    Proxy,
}

/// Progress reported during `ServiceRegistry::initialize`: a step name and
/// a 0..100 completion percentage.
#[derive(Debug, Clone)]
pub struct InitProgress {
    pub step: &'static str,
    pub percent: u8,
}

impl Default for InitProgress {
    fn default() -> Self {
        Self {
            step: "not_started",
            percent: 0,
        }
    }
}

/// Host-mode process-wide service registry: constructs the database driver,
/// embedding service, and LLM service from configuration, and tracks
/// idempotent initialization. A proxy-mode process builds the RPC-backed
/// equivalent in the `rpc` crate using the same `EmbeddingService`/
/// `LlmService` traits.
pub struct ServiceRegistry {
    pub mode: Mode,
    pub db: Arc<SurrealDbClient>,
    pub embedding: Arc<dyn EmbeddingService>,
    pub llm: Arc<dyn LlmService>,
    ready: RwLock<bool>,
    progress: watch::Sender<InitProgress>,
}

impl ServiceRegistry {
    /// Connects to SurrealDB and builds the OpenAI-backed embedding/LLM
    /// adapters named by `config`. Does not run migrations or mark the
    /// registry ready — call `initialize` for that.
    pub async fn connect_host(config: &AppConfig) -> Result<Self, AppError> {
        let db = SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await
        .map_err(AppError::Database)?;

        let openai = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(config.openai_api_key.clone())
                .with_api_base(config.openai_base_url.clone()),
        );

        let embedding = Arc::new(OpenAiEmbeddingService::new(
            openai.clone(),
            config.embedding_model.clone(),
            config.embedding_dimensions,
        ));
        let llm = Arc::new(OpenAiLlmService::new(openai, config.chat_model.clone()));

        let (progress, _) = watch::channel(InitProgress::default());

        Ok(Self {
            mode: Mode::Host,
            db: Arc::new(db),
            embedding,
            llm,
            ready: RwLock::new(false),
            progress,
        })
    }

    /// Runs schema migrations, builds runtime indexes, and readies the
    /// embedding service, reporting progress after each step. Safe to call
    /// more than once; later calls are no-ops once `is_ready()`.
    pub async fn initialize(&self, embedding_dimension: usize) -> Result<(), AppError> {
        if *self.ready.read().await {
            return Ok(());
        }

        self.report(InitProgress {
            step: "migrations",
            percent: 10,
        });
        self.db.apply_migrations().await?;

        self.report(InitProgress {
            step: "indexes",
            percent: 50,
        });
        crate::storage::indexes::ensure_runtime_indexes(&self.db, embedding_dimension).await?;

        self.report(InitProgress {
            step: "embedding_service",
            percent: 80,
        });
        self.embedding.initialize().await?;

        self.report(InitProgress {
            step: "ready",
            percent: 100,
        });
        *self.ready.write().await = true;
        Ok(())
    }

    #[cfg(any(test, feature = "test-utils"))]
    /// Builds a registry against an in-memory database, for tests that
    /// don't need a real SurrealDB connection.
    pub async fn host_for_test(config: &AppConfig) -> Result<Self, AppError> {
        let db = SurrealDbClient::memory(&config.surrealdb_namespace, &config.surrealdb_database)
            .await
            .map_err(AppError::Database)?;

        let openai = Client::with_config(
            OpenAIConfig::new().with_api_key(config.openai_api_key.clone()),
        );
        let embedding = Arc::new(OpenAiEmbeddingService::new(
            openai.clone(),
            config.embedding_model.clone(),
            config.embedding_dimensions,
        ));
        let llm = Arc::new(OpenAiLlmService::new(openai, config.chat_model.clone()));
        let (progress, _) = watch::channel(InitProgress::default());

        Ok(Self {
            mode: Mode::Host,
            db: Arc::new(db),
            embedding,
            llm,
            ready: RwLock::new(false),
            progress,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.try_read().map(|guard| *guard).unwrap_or(false)
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<InitProgress> {
        self.progress.subscribe()
    }

    fn report(&self, progress: InitProgress) {
        let _ = self.progress.send(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        AppConfig {
            openai_api_key: "test-key".to_string(),
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: String::new(),
            surrealdb_password: String::new(),
            surrealdb_namespace: "registry_ns".to_string(),
            surrealdb_database: uuid::Uuid::new_v4().to_string(),
            data_dir: "./data".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 768,
            chat_model: "gpt-4o-mini".to_string(),
            rpc_timeout_secs: 30,
            rpc_retry_base_ms: 100,
            rpc_max_retries: 3,
            job_visibility_secs: 60,
            job_heartbeat_secs: 20,
            chunk_size: 5,
            chunk_max_concurrency: 2,
            entity_match_threshold: 0.85,
            fact_match_threshold: 0.90,
        }
    }

    #[tokio::test]
    async fn initialize_reports_progress_and_is_idempotent() {
        let registry = ServiceRegistry::host_for_test(&test_config())
            .await
            .expect("connect");
        let mut progress = registry.subscribe_progress();

        registry.initialize(768).await.expect("first init");
        assert!(registry.is_ready());

        progress.changed().await.expect("progress reported");
        assert_eq!(progress.borrow().step, "ready");

        registry.initialize(768).await.expect("second init is a no-op");
    }
}
