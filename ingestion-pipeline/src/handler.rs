//! Wires `IngestionPipeline` into the job queue as the handler for
//! `convert-to-kg`: loads the capture, opens its `source` provenance row,
//! runs the pipeline, and reports entity/relation counts as the job
//! result.

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        job::{Job, JobType},
        remembered_content::RememberedContent,
        source::{Source, TargetType},
    },
};
use jobqueue::{JobDeps, JobHandler};
use serde::Deserialize;
use tracing::warn;

use crate::pipeline::{IngestionConfig, IngestionPipeline};

#[derive(Debug, Deserialize)]
struct ConvertToKgPayload {
    #[serde(rename = "contentId")]
    content_id: String,
}

pub struct IngestionJobHandler {
    pipeline: IngestionPipeline,
}

impl IngestionJobHandler {
    pub fn new(config: IngestionConfig) -> Self {
        Self {
            pipeline: IngestionPipeline::new(config),
        }
    }
}

#[async_trait]
impl JobHandler for IngestionJobHandler {
    fn job_type(&self) -> JobType {
        JobType::ConvertToKg
    }

    async fn process(&self, job: &Job, deps: &JobDeps) -> Result<serde_json::Value, AppError> {
        let payload: ConvertToKgPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| AppError::Validation(err.to_string()))?;

        let content: RememberedContent = deps
            .db
            .get_item(&payload.content_id)
            .await
            .map_err(AppError::Database)?
            .ok_or_else(|| AppError::NotFound(format!("remembered_content {}", payload.content_id)))?;

        let graph = content.topic_id.clone().unwrap_or_default();
        let reference_timestamp = chrono::Utc::now();

        let source = Source::new(TargetType::RememberedContent, content.id.clone());
        deps.db.store_item(source.clone()).await.map_err(AppError::Database)?;
        Source::mark_processing(&deps.db, &source.id).await?;

        let outcome = self
            .pipeline
            .run(
                &deps.db,
                deps.embedding.as_ref(),
                deps.llm.as_ref(),
                &content,
                graph,
                reference_timestamp,
                &source.id,
                &job.id,
            )
            .await;

        match outcome {
            Ok(stats) => Ok(serde_json::json!({
                "entitiesCreated": stats.entities_created,
                "relationsCreated": stats.relations_created,
            })),
            Err(err) => {
                if let Err(mark_err) = Source::mark_failed(&deps.db, &source.id).await {
                    warn!(error = %mark_err, source_id = %source.id, "failed to mark source as failed");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        storage::{db::SurrealDbClient, types::remembered_content::SourceType},
        utils::services::{ChatMessage, ChatRole, EmbeddingService, LlmService},
    };
    use std::sync::Arc;
    use uuid::Uuid;

    struct FixedEmbedding;

    #[async_trait]
    impl EmbeddingService for FixedEmbedding {
        async fn text_to_vector(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Ok(vec![0.1, 0.2, 0.3])
        }
        async fn texts_to_vectors(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }
        async fn initialize(&self) -> Result<(), AppError> {
            Ok(())
        }
        fn is_ready(&self) -> bool {
            true
        }
        fn dimensions(&self) -> u32 {
            3
        }
    }

    struct ScriptedLlm {
        entities_json: String,
        facts_json: String,
    }

    #[async_trait]
    impl LlmService for ScriptedLlm {
        async fn chat_completions(&self, messages: Vec<ChatMessage>) -> Result<String, AppError> {
            let is_fact_call = messages
                .iter()
                .any(|m| m.role == ChatRole::System && m.content.contains("factual relationships"));
            if is_fact_call {
                return Ok(self.facts_json.clone());
            }
            let is_entity_call = messages
                .iter()
                .any(|m| m.role == ChatRole::System && m.content.contains("named entities"));
            if is_entity_call {
                return Ok(self.entities_json.clone());
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
            vec!["test-model".to_string()]
        }
        async fn set_current_model(&self, _model_id: &str) -> Result<(), AppError> {
            Ok(())
        }
        fn on_current_model_change(&self) -> tokio::sync::watch::Receiver<String> {
            tokio::sync::watch::channel(String::new()).1
        }
    }

    async fn setup_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("handler_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn processes_a_convert_to_kg_job_end_to_end() {
        let db = setup_db().await;

        let content = RememberedContent::new(
            SourceType::RawText,
            None,
            None,
            "AlphaCorp buys BetaInc".to_string(),
            "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.".to_string(),
            "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.".to_string(),
            "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.".to_string(),
            serde_json::json!({}),
            serde_json::json!({}),
            None,
        );
        db.store_item(content.clone()).await.expect("store content");

        let job = Job::new(
            JobType::ConvertToKg,
            serde_json::json!({"contentId": content.id}),
        );
        db.store_item(job.clone()).await.expect("store job");

        let deps = JobDeps {
            db: Arc::new(db),
            embedding: Arc::new(FixedEmbedding),
            llm: Arc::new(ScriptedLlm {
                entities_json: r#"{"entities": [{"name": "AlphaCorp", "node_type": "organization", "summary": null}, {"name": "BetaInc", "node_type": "organization", "summary": null}]}"#.to_string(),
                facts_json: r#"{"facts": [{"subject": "AlphaCorp", "object": "BetaInc", "edge_type": "acquires", "fact_text": "AlphaCorp acquires BetaInc"}]}"#.to_string(),
            }),
        };

        let handler = IngestionJobHandler::new(IngestionConfig::default());
        let result = handler.process(&job, &deps).await.expect("pipeline succeeds");

        assert_eq!(result["entitiesCreated"], serde_json::json!(2));
        assert_eq!(result["relationsCreated"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn aborted_job_fails_the_source_and_writes_no_graph_rows() {
        let db = setup_db().await;

        let content = RememberedContent::new(
            SourceType::RawText,
            None,
            None,
            "AlphaCorp buys BetaInc".to_string(),
            "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.".to_string(),
            "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.".to_string(),
            "AlphaCorp announced on 2024-03-01 that it will acquire BetaInc.".to_string(),
            serde_json::json!({}),
            serde_json::json!({}),
            None,
        );
        db.store_item(content.clone()).await.expect("store content");

        let job = Job::new(
            JobType::ConvertToKg,
            serde_json::json!({"contentId": content.id}),
        );
        db.store_item(job.clone()).await.expect("store job");
        Job::mark_processing(&db, &job.id).await.expect("mark processing");
        Job::mark_aborted(&db, &job.id).await.expect("mark aborted");

        let deps = JobDeps {
            db: Arc::new(db),
            embedding: Arc::new(FixedEmbedding),
            llm: Arc::new(ScriptedLlm {
                entities_json: r#"{"entities": [{"name": "AlphaCorp", "node_type": "organization", "summary": null}]}"#.to_string(),
                facts_json: r#"{"facts": []}"#.to_string(),
            }),
        };

        let handler = IngestionJobHandler::new(IngestionConfig::default());
        let err = handler
            .process(&job, &deps)
            .await
            .expect_err("aborted job must fail");
        assert!(matches!(err, AppError::Cancelled));

        let nodes: Vec<common::storage::types::node::Node> = deps
            .db
            .client
            .query("SELECT * FROM node")
            .await
            .expect("query nodes")
            .take(0)
            .expect("rows");
        assert!(nodes.is_empty(), "no node rows should survive an aborted run");

        let sources: Vec<Source> = deps
            .db
            .client
            .query("SELECT * FROM source")
            .await
            .expect("query sources")
            .take(0)
            .expect("rows");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].status, common::storage::types::source::SourceStatus::Failed);
    }
}
